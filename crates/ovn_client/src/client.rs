//! Connection lifecycle and the monitor consumer.
//!
//! A client owns at most one live transport at a time. Connecting fetches
//! both database schemas, seeds the replica with `monitor_cond_since`
//! (falling back to the classic `monitor` dump on old servers), and keeps
//! a `_Server` monitor alongside to track raft leadership. Every incoming
//! update is tagged with the generation of the connection that produced
//! it; updates from a torn-down connection are discarded instead of being
//! merged into the rebuilt replica.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ovsdb_link::ops::{MonitorRequest, Operation, OperationResult, TableUpdates, TableUpdates2};
use ovsdb_link::rustls;
use ovsdb_link::schema::DatabaseSchema;
use ovsdb_link::{Endpoint, Notification, Transport, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::apply::{apply_delta, apply_snapshot, CacheEvent};
use crate::cache::TableCache;
use crate::config::{builtin_tables, Config, DB_SERVER, TABLE_DATABASE, ZERO_TXN};
use crate::error::Error;
use crate::signal::{self, SignalHandler};

const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);
const RECONNECT_LOG_CAP: u32 = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-connection state, replaced wholesale on every (re)connect.
#[derive(Default)]
struct ConnState {
    transport: Option<Arc<Transport>>,
    schema: Option<Arc<DatabaseSchema>>,
    server_schema: Option<Arc<DatabaseSchema>>,
    tables: Arc<BTreeMap<String, Vec<String>>>,
    server_tables: Arc<BTreeMap<String, Vec<String>>>,
}

pub(crate) struct ClientInner {
    db: String,
    endpoints: Vec<Endpoint>,
    tls: Option<Arc<rustls::ClientConfig>>,
    user_tables: BTreeMap<String, Vec<String>>,
    leader_only: bool,
    timeout: Duration,
    auto_reconnect: bool,
    signal: Option<Arc<dyn SignalHandler>>,
    pub(crate) cache: RwLock<TableCache>,
    server_cache: RwLock<TableCache>,
    conn: RwLock<ConnState>,
    /// Read-held by every transact, write-held for the whole of a
    /// reconnect, so transactions wait out the rebuild instead of
    /// racing a half-seeded replica.
    tran_lock: RwLock<()>,
    /// Monitor resume cursor; advances only when an update is applied.
    last_txn: Mutex<String>,
    /// Index into `endpoints`, advanced past an endpoint that failed
    /// or lost leadership and left to rest on one that worked.
    cursor: AtomicUsize,
    /// Connection generation; bumped on every dial so the consumer can
    /// tell live updates from stragglers of a dead connection.
    generation: AtomicU64,
    closed: AtomicBool,
    disconnect_tx: mpsc::Sender<()>,
}

/// Handle to a continuously synchronized replica of one OVN database.
///
/// Cheap to clone; all clones share the replica and the connection.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Validate `config`, dial the first usable endpoint, and seed the
    /// replica. Resolves once the initial table contents are in memory.
    pub async fn connect(config: Config) -> Result<Client, Error> {
        config.validate()?;
        let endpoints = config.endpoints()?;
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let inner = Arc::new(ClientInner {
            db: config.db,
            endpoints,
            tls: config.tls,
            user_tables: config.table_cols,
            leader_only: config.leader_only,
            timeout: config.timeout,
            auto_reconnect: config.reconnect,
            signal: config.signal,
            cache: RwLock::new(TableCache::new()),
            server_cache: RwLock::new(TableCache::new()),
            conn: RwLock::new(ConnState::default()),
            tran_lock: RwLock::new(()),
            last_txn: Mutex::new(ZERO_TXN.to_owned()),
            cursor: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            disconnect_tx,
        });
        tokio::spawn(drain_disconnects(Arc::clone(&inner), disconnect_rx));
        inner.connect().await?;
        Ok(Client { inner })
    }

    /// Tear the connection down for good. Monitor cancellation is best
    /// effort; the server reaps monitors with the session anyway.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let transport = self.inner.conn.write().await.transport.take();
        if let Some(transport) = transport {
            for context in [self.inner.db.as_str(), DB_SERVER] {
                if let Err(err) = transport.monitor_cancel(context).await {
                    debug!(%context, error = %err, "monitor cancel failed during close");
                }
            }
            transport.disconnect();
        }
    }

    pub fn db(&self) -> &str {
        &self.inner.db
    }

    /// Endpoint of the current connection, if there is one.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner
            .conn
            .read()
            .await
            .transport
            .as_ref()
            .map(|t| t.endpoint().clone())
    }

    /// Schema of the replicated database, as served at connect time.
    pub async fn schema(&self) -> Option<Arc<DatabaseSchema>> {
        self.inner.conn.read().await.schema.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .conn
            .read()
            .await
            .transport
            .as_ref()
            .is_some_and(|t| !t.is_closed())
    }

    /// Transaction id the replica is synchronized up to.
    pub fn last_txn(&self) -> String {
        lock(&self.inner.last_txn).clone()
    }

    /// Fetch a schema over the live connection, bypassing the replica.
    pub async fn get_schema(&self, db: &str) -> Result<DatabaseSchema, Error> {
        let transport = self.inner.live_transport().await?;
        Ok(transport.get_schema(db).await?)
    }
}

impl ClientInner {
    async fn live_transport(&self) -> Result<Arc<Transport>, Error> {
        self.conn
            .read()
            .await
            .transport
            .as_ref()
            .filter(|t| !t.is_closed())
            .cloned()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    /// Establish a connection if there is none, trying endpoints from
    /// the cursor onward and leaving the cursor on the one that worked.
    async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let mut conn = self.conn.write().await;
        if conn.transport.as_ref().is_some_and(|t| !t.is_closed()) {
            return Ok(());
        }
        if let Some(stale) = conn.transport.take() {
            stale.disconnect();
        }
        let total = self.endpoints.len();
        for _ in 0..total {
            let endpoint = &self.endpoints[self.cursor.load(Ordering::SeqCst) % total];
            match self.connect_endpoint(&mut conn, endpoint).await {
                Ok(()) => {
                    info!(peer = %endpoint, db = %self.db, "replica connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(peer = %endpoint, error = %err, "endpoint unusable, rotating");
                    self.cursor.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Err(Error::Connection(format!(
            "no usable endpoint among {total} candidates"
        )))
    }

    async fn connect_endpoint(
        self: &Arc<Self>,
        conn: &mut ConnState,
        endpoint: &Endpoint,
    ) -> Result<(), Error> {
        // Fresh generation and channel per attempt; stragglers queued by
        // an older connection no longer match and get dropped.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(consume(Arc::clone(self), notify_rx, generation));

        let transport = Arc::new(
            Transport::connect(endpoint, self.tls.clone(), self.timeout, notify_tx).await?,
        );
        match self.start_monitors(conn, &transport).await {
            Ok(()) => {
                conn.transport = Some(Arc::clone(&transport));
                tokio::spawn(watch_transport(Arc::clone(self), transport));
                Ok(())
            }
            Err(err) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                transport.disconnect();
                Err(err)
            }
        }
    }

    /// Fetch schemas, seed both replicas, and verify leadership. Holds
    /// the cache locks across the monitor calls so that updates streamed
    /// behind the initial contents queue up instead of applying early.
    async fn start_monitors(
        self: &Arc<Self>,
        conn: &mut ConnState,
        transport: &Arc<Transport>,
    ) -> Result<(), Error> {
        let schema = Arc::new(transport.get_schema(&self.db).await?);
        let server_schema = Arc::new(transport.get_schema(DB_SERVER).await?);
        let tables = Arc::new(resolve_tables(&self.user_tables, &self.db, &schema)?);
        let server_tables = Arc::new(resolve_tables(
            &BTreeMap::new(),
            DB_SERVER,
            &server_schema,
        )?);

        let mut cache = self.cache.write().await;
        let mut server_cache = self.server_cache.write().await;

        let requests = monitor_requests(&tables);
        let since = lock(&self.last_txn).clone();
        match transport
            .monitor_cond_since(&self.db, &self.db, &requests, &since)
            .await
        {
            Ok(reply) => {
                if !reply.found || reply.last_txn == ZERO_TXN {
                    cache.clear();
                }
                *lock(&self.last_txn) = reply.last_txn;
                apply_delta(&mut cache, &schema, &tables, reply.updates, false);
            }
            Err(err) if unknown_method(&err) => {
                debug!(db = %self.db, "monitor_cond_since unsupported, using classic monitor");
                let dump = transport.monitor(&self.db, &self.db, &requests).await?;
                cache.clear();
                *lock(&self.last_txn) = ZERO_TXN.to_owned();
                apply_snapshot(&mut cache, &tables, dump, false);
            }
            Err(err) => return Err(err.into()),
        }

        let server_requests = monitor_requests(&server_tables);
        let dump = transport
            .monitor_cond(DB_SERVER, DB_SERVER, &server_requests)
            .await?;
        server_cache.clear();
        apply_delta(&mut server_cache, &server_schema, &server_tables, dump, false);

        if self.leader_only && !is_leader(&server_cache, &self.db) {
            return Err(Error::Connection(format!(
                "{} is not the raft leader for {}",
                transport.endpoint(),
                self.db
            )));
        }

        conn.schema = Some(schema);
        conn.server_schema = Some(server_schema);
        conn.tables = tables;
        conn.server_tables = server_tables;
        Ok(())
    }

    /// Run one atomic transaction against the replicated database.
    pub(crate) async fn transact(
        &self,
        ops: &[Operation],
    ) -> Result<Vec<OperationResult>, Error> {
        let _permit = self.tran_lock.read().await;
        let transport = self.live_transport().await?;
        let results = transport.transact(&self.db, ops).await?;
        for (index, result) in results.iter().enumerate() {
            let Some(failure) = result.failure() else {
                continue;
            };
            // A refused transaction can mean this server fell behind its
            // cluster, so the connection is dropped and rebuilt.
            self.request_disconnect();
            let context = if index < ops.len() {
                format!("{} on {}", ops[index].op, ops[index].table)
            } else {
                "committing the batch".to_owned()
            };
            let details = result
                .details
                .as_deref()
                .filter(|d| !d.is_empty())
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            return Err(Error::Transaction(format!(
                "{failure} during {context}{details}"
            )));
        }
        if results.len() < ops.len() {
            return Err(Error::Conformance(format!(
                "{} operations answered by {} results",
                ops.len(),
                results.len()
            )));
        }
        Ok(results)
    }

    fn request_disconnect(&self) {
        if self.disconnect_tx.try_send(()).is_err() {
            debug!("disconnect already queued");
        }
    }

    async fn on_snapshot(self: &Arc<Self>, context: &str, updates: TableUpdates, generation: u64) {
        if context != self.db {
            debug!(%context, "snapshot update for an unknown monitor");
            return;
        }
        let tables = Arc::clone(&self.conn.read().await.tables);
        let events = {
            let mut cache = self.cache.write().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "dropping update from a previous connection");
                return;
            }
            apply_snapshot(&mut cache, &tables, updates, true)
        };
        self.dispatch(&events);
    }

    async fn on_delta(
        self: &Arc<Self>,
        context: &str,
        last_txn: Option<String>,
        updates: TableUpdates2,
        generation: u64,
    ) {
        if context == DB_SERVER {
            self.on_server_delta(updates, generation).await;
            return;
        }
        if context != self.db {
            debug!(%context, "update for an unknown monitor");
            return;
        }
        let (schema, tables) = {
            let conn = self.conn.read().await;
            match conn.schema.clone() {
                Some(schema) => (schema, Arc::clone(&conn.tables)),
                None => return,
            }
        };
        let events = {
            let mut cache = self.cache.write().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "dropping update from a previous connection");
                return;
            }
            // The cursor moves with the applied update; a dropped update
            // is re-delivered when the next monitor resumes from here.
            if let Some(txn) = last_txn {
                *lock(&self.last_txn) = txn;
            }
            apply_delta(&mut cache, &schema, &tables, updates, true)
        };
        self.dispatch(&events);
    }

    async fn on_server_delta(self: &Arc<Self>, updates: TableUpdates2, generation: u64) {
        let (schema, tables) = {
            let conn = self.conn.read().await;
            match conn.server_schema.clone() {
                Some(schema) => (schema, Arc::clone(&conn.server_tables)),
                None => return,
            }
        };
        let about_database = updates.contains_key(TABLE_DATABASE);
        let mut server_cache = self.server_cache.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        apply_delta(&mut server_cache, &schema, &tables, updates, false);
        if about_database && self.leader_only && !is_leader(&server_cache, &self.db) {
            warn!(db = %self.db, "leadership moved away, dropping the connection");
            self.cursor.fetch_add(1, Ordering::SeqCst);
            self.request_disconnect();
        }
    }

    fn dispatch(&self, events: &[CacheEvent]) {
        if let Some(handler) = &self.signal {
            for event in events {
                signal::dispatch(handler.as_ref(), event);
            }
        }
    }
}

async fn consume(
    inner: Arc<ClientInner>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    generation: u64,
) {
    while let Some(note) = notifications.recv().await {
        match note {
            Notification::Update { context, updates } => {
                inner.on_snapshot(&context, updates, generation).await;
            }
            Notification::Update2 { context, updates } => {
                inner.on_delta(&context, None, updates, generation).await;
            }
            Notification::Update3 {
                context,
                last_txn,
                updates,
            } => {
                inner
                    .on_delta(&context, Some(last_txn), updates, generation)
                    .await;
            }
            Notification::Locked(context) => debug!(%context, "lock granted"),
            Notification::Stolen(context) => warn!(%context, "lock stolen"),
        }
    }
}

/// Serialize forced disconnects. The requesting side never blocks; a
/// full queue means a teardown is already on its way.
async fn drain_disconnects(inner: Arc<ClientInner>, mut requests: mpsc::Receiver<()>) {
    while requests.recv().await.is_some() {
        let transport = inner.conn.write().await.transport.take();
        if let Some(transport) = transport {
            transport.disconnect();
        }
    }
}

async fn watch_transport(inner: Arc<ClientInner>, transport: Arc<Transport>) {
    transport.closed().await;
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    if inner.auto_reconnect {
        tokio::spawn(reconnect(inner));
    } else {
        warn!(peer = %transport.endpoint(), "connection lost and reconnect is disabled");
    }
}

// Boxed rather than `async fn`: the spawn cycle reconnect -> connect ->
// connect_endpoint -> watch_transport -> reconnect would otherwise make
// the opaque future's `Send` bound uncomputable.
fn reconnect(inner: Arc<ClientInner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _hold = inner.tran_lock.write().await;
        let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
        let mut retries: u32 = 0;
        loop {
            ticker.tick().await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match inner.connect().await {
                Ok(()) => {
                    info!(retries, "replica connection restored");
                    return;
                }
                Err(err) => {
                    retries += 1;
                    if retries < RECONNECT_LOG_CAP {
                        warn!(error = %err, retries, "reconnect attempt failed");
                    } else if retries == RECONNECT_LOG_CAP {
                        warn!(
                            error = %err,
                            retries,
                            "reconnect attempt failed, suppressing further logging"
                        );
                    }
                }
            }
        }
    })
}

/// Leadership of `db` according to the `_Server` replica. Standalone
/// servers and servers that do not report a matching row count as
/// leaders; only a clustered row saying otherwise excludes a server.
fn is_leader(server_cache: &TableCache, db: &str) -> bool {
    for (_, row) in server_cache.rows(TABLE_DATABASE) {
        if row.get("name").and_then(Value::as_str) != Some(db) {
            continue;
        }
        if row.get("model").and_then(Value::as_str) != Some("clustered") {
            return true;
        }
        return row.get("leader").and_then(Value::opt_bool).unwrap_or(false);
    }
    true
}

fn resolve_tables(
    requested: &BTreeMap<String, Vec<String>>,
    db: &str,
    schema: &DatabaseSchema,
) -> Result<BTreeMap<String, Vec<String>>, Error> {
    let mut tables = BTreeMap::new();
    if requested.is_empty() {
        for name in builtin_tables(db) {
            if schema.table(name).is_some() {
                tables.insert((*name).to_owned(), Vec::new());
            }
        }
        if tables.is_empty() {
            return Err(Error::Schema(format!(
                "schema for {db} has none of the expected tables"
            )));
        }
        return Ok(tables);
    }
    for (name, columns) in requested {
        if schema.table(name).is_none() {
            return Err(Error::Schema(format!(
                "table {name} is not in the {db} schema"
            )));
        }
        if !columns.is_empty() {
            return Err(Error::Schema(format!(
                "monitoring a column subset of {name} is not supported"
            )));
        }
        tables.insert(name.clone(), Vec::new());
    }
    Ok(tables)
}

fn monitor_requests(tables: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, MonitorRequest> {
    tables
        .keys()
        .map(|name| (name.clone(), MonitorRequest::all_columns()))
        .collect()
}

fn unknown_method(err: &ovsdb_link::Error) -> bool {
    matches!(err, ovsdb_link::Error::Rpc { message, .. } if message.contains("unknown method"))
}
