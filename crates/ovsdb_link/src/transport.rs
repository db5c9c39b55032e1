//! One JSON-RPC connection to a database server.
//!
//! A [`Transport`] owns the socket through two spawned halves: a write
//! loop draining an outbound queue into the sink, and a read loop that
//! correlates responses with pending calls, answers the server's echo
//! probes, and forwards monitor notifications to a single consumer
//! channel. Callers only ever see async methods returning `Result`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{JsonCodec, RpcMessage};
use crate::ops::{
    LockReply, MonitorCondSinceReply, MonitorRequest, Operation, OperationResult, TableUpdates,
    TableUpdates2,
};
use crate::schema::DatabaseSchema;
use crate::Error;

/// Byte stream the codec runs over, plain or TLS.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type WireSink = SplitSink<Framed<Box<dyn Io>, JsonCodec>, RpcMessage>;
type WireStream = SplitStream<Framed<Box<dyn Io>, JsonCodec>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        })
    }
}

/// One server address, e.g. `tcp:10.0.0.1:6641` or `ssl:nb.ovn:6641`.
///
/// A bare `host:port` is taken as plain TCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(text: &str) -> Result<Endpoint, Error> {
        let (scheme, rest) = match text.split_once(':') {
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("ssl", rest)) => (Scheme::Ssl, rest),
            _ => (Scheme::Tcp, text),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Endpoint(format!("{text:?} is missing a port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Endpoint(format!("{text:?} is missing a host")));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Endpoint(format!("{text:?} has a bad port")))?;
        Ok(Endpoint {
            scheme,
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
    }
}

/// Server-initiated message forwarded to the replica layer.
#[derive(Clone, Debug)]
pub enum Notification {
    /// Classic `update` with old/new row pairs.
    Update {
        context: String,
        updates: TableUpdates,
    },
    /// `update2` with delta rows.
    Update2 {
        context: String,
        updates: TableUpdates2,
    },
    /// `update3` with delta rows and the transaction cursor.
    Update3 {
        context: String,
        last_txn: String,
        updates: TableUpdates2,
    },
    Locked(String),
    Stolen(String),
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<serde_json::Value, Error>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live connection handle. Cheap to share behind an `Arc`.
pub struct Transport {
    endpoint: Endpoint,
    next_id: AtomicU64,
    pending: PendingMap,
    out_tx: mpsc::Sender<RpcMessage>,
    closed_rx: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
    timeout: Duration,
}

impl Transport {
    /// Dial `endpoint` and spawn the connection's read and write halves.
    ///
    /// Notifications arrive on `notify_tx` in wire order. The channel is
    /// unbounded so a consumer busy applying one update can never stall
    /// the read loop and with it the rpc replies it is waiting on.
    pub async fn connect(
        endpoint: &Endpoint,
        tls: Option<Arc<rustls::ClientConfig>>,
        timeout: Duration,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Result<Transport, Error> {
        let tcp = tokio::time::timeout(
            timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            method: "connect".into(),
            timeout,
        })??;
        tcp.set_nodelay(true)?;

        let io: Box<dyn Io> = match endpoint.scheme {
            Scheme::Tcp => Box::new(tcp),
            Scheme::Ssl => {
                let config = tls
                    .ok_or_else(|| Error::Tls(format!("{endpoint} needs a client tls config")))?;
                let name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| Error::Tls(format!("bad server name {:?}: {e}", endpoint.host)))?;
                let stream = TlsConnector::from(config).connect(name, tcp).await?;
                Box::new(stream)
            }
        };

        let (sink, stream) = Framed::new(io, JsonCodec).split();
        let (out_tx, out_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let peer = endpoint.to_string();
        tokio::spawn(write_loop(peer.clone(), sink, out_rx));
        tokio::spawn(read_loop(
            peer,
            stream,
            Arc::clone(&pending),
            out_tx.clone(),
            notify_tx,
            Arc::clone(&shutdown),
            closed_tx,
        ));

        Ok(Transport {
            endpoint: endpoint.clone(),
            next_id: AtomicU64::new(1),
            pending,
            out_tx,
            closed_rx,
            shutdown,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Ask the read loop to stop; pending calls fail with [`Error::Closed`].
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve once the connection has shut down, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn call_raw(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingCall {
                method: method.to_owned(),
                reply: reply_tx,
            },
        );

        let frame = RpcMessage::request(id, method, params);
        if self.out_tx.send(frame).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(Error::Closed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(Error::Timeout {
                    method: method.to_owned(),
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, Error> {
        let raw = self.call_raw(method, params).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn get_schema(&self, db: &str) -> Result<DatabaseSchema, Error> {
        self.call("get_schema", json!([db])).await
    }

    /// Run one atomic transaction. The reply carries one result per
    /// operation; members past a failed operation may arrive as null.
    pub async fn transact(
        &self,
        db: &str,
        ops: &[Operation],
    ) -> Result<Vec<OperationResult>, Error> {
        let mut params = Vec::with_capacity(ops.len() + 1);
        params.push(serde_json::Value::from(db));
        for op in ops {
            params.push(serde_json::to_value(op)?);
        }
        let raw: Vec<serde_json::Value> = self
            .call("transact", serde_json::Value::Array(params))
            .await?;
        let mut results = Vec::with_capacity(raw.len());
        for member in raw {
            if member.is_null() {
                results.push(OperationResult::default());
            } else {
                results.push(serde_json::from_value(member)?);
            }
        }
        Ok(results)
    }

    pub async fn monitor(
        &self,
        db: &str,
        context: &str,
        requests: &std::collections::BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates, Error> {
        self.call("monitor", json!([db, context, requests])).await
    }

    pub async fn monitor_cond(
        &self,
        db: &str,
        context: &str,
        requests: &std::collections::BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates2, Error> {
        self.call("monitor_cond", json!([db, context, requests]))
            .await
    }

    /// Conditional monitor resuming from `last_txn`; pass the zero id to
    /// request a full snapshot.
    pub async fn monitor_cond_since(
        &self,
        db: &str,
        context: &str,
        requests: &std::collections::BTreeMap<String, MonitorRequest>,
        last_txn: &str,
    ) -> Result<MonitorCondSinceReply, Error> {
        let raw = self
            .call_raw("monitor_cond_since", json!([db, context, requests, last_txn]))
            .await?;
        let (found, last_txn, updates): (bool, String, TableUpdates2) =
            serde_json::from_value(raw)?;
        Ok(MonitorCondSinceReply {
            found,
            last_txn,
            updates,
        })
    }

    pub async fn monitor_cancel(&self, context: &str) -> Result<(), Error> {
        self.call_raw("monitor_cancel", json!([context]))
            .await
            .map(drop)
    }

    pub async fn lock(&self, id: &str) -> Result<bool, Error> {
        let reply: LockReply = self.call("lock", json!([id])).await?;
        Ok(reply.locked)
    }

    pub async fn steal(&self, id: &str) -> Result<bool, Error> {
        let reply: LockReply = self.call("steal", json!([id])).await?;
        Ok(reply.locked)
    }

    pub async fn unlock(&self, id: &str) -> Result<(), Error> {
        self.call_raw("unlock", json!([id])).await.map(drop)
    }

    /// Liveness probe; the server must echo the params back verbatim.
    pub async fn echo(&self) -> Result<(), Error> {
        let params = json!([self.endpoint.to_string()]);
        let reply = self.call_raw("echo", params.clone()).await?;
        if reply == params {
            Ok(())
        } else {
            Err(Error::Frame(format!("echo answered with {reply}")))
        }
    }
}

async fn write_loop(peer: String, mut sink: WireSink, mut out_rx: mpsc::Receiver<RpcMessage>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = sink.send(frame).await {
            debug!(%peer, error = %err, "write side closed");
            break;
        }
    }
}

async fn read_loop(
    peer: String,
    mut stream: WireStream,
    pending: PendingMap,
    out_tx: mpsc::Sender<RpcMessage>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    shutdown: Arc<Notify>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!(%peer, "shutting down connection");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(msg)) => route(&peer, msg, &pending, &out_tx, &notify_tx).await,
                Some(Err(err)) => {
                    warn!(%peer, error = %err, "rpc stream failed");
                    break;
                }
                None => {
                    debug!(%peer, "server closed the stream");
                    break;
                }
            },
        }
    }

    for (_, call) in lock(&pending).drain() {
        let _ = call.reply.send(Err(Error::Closed));
    }
    let _ = closed_tx.send(true);
}

async fn route(
    peer: &str,
    msg: RpcMessage,
    pending: &PendingMap,
    out_tx: &mpsc::Sender<RpcMessage>,
    notify_tx: &mpsc::UnboundedSender<Notification>,
) {
    if msg.is_notification() {
        let method = msg.method.unwrap_or_default();
        let params = msg.params.unwrap_or(serde_json::Value::Null);
        match parse_notification(&method, params) {
            Ok(notification) => {
                if notify_tx.send(notification).is_err() {
                    debug!(%peer, %method, "notification consumer is gone");
                }
            }
            Err(err) => warn!(%peer, %method, error = %err, "dropping bad notification"),
        }
        return;
    }

    if msg.is_request() {
        match msg.method.as_deref() {
            Some("echo") => {
                let reply =
                    RpcMessage::response(msg.id, msg.params.unwrap_or_else(|| json!([])));
                if out_tx.send(reply).await.is_err() {
                    debug!(%peer, "echo reply dropped, writer is gone");
                }
            }
            Some(other) => debug!(%peer, method = %other, "ignoring server request"),
            None => {}
        }
        return;
    }

    let Some(id) = msg.id_u64() else {
        warn!(%peer, id = %msg.id, "response with an id we never issued");
        return;
    };
    let Some(call) = lock(pending).remove(&id) else {
        debug!(%peer, id, "response for a finished call");
        return;
    };
    let outcome = match msg.error {
        Some(error) if !error.is_null() => Err(Error::Rpc {
            method: call.method,
            message: error_text(&error),
        }),
        _ => Ok(msg.result.unwrap_or(serde_json::Value::Null)),
    };
    let _ = call.reply.send(outcome);
}

fn parse_notification(method: &str, params: serde_json::Value) -> Result<Notification, Error> {
    match method {
        "update" => {
            let (context, updates): (serde_json::Value, TableUpdates) =
                serde_json::from_value(params)?;
            Ok(Notification::Update {
                context: context_text(context),
                updates,
            })
        }
        "update2" => {
            let (context, updates): (serde_json::Value, TableUpdates2) =
                serde_json::from_value(params)?;
            Ok(Notification::Update2 {
                context: context_text(context),
                updates,
            })
        }
        "update3" => {
            let (context, last_txn, updates): (serde_json::Value, String, TableUpdates2) =
                serde_json::from_value(params)?;
            Ok(Notification::Update3 {
                context: context_text(context),
                last_txn,
                updates,
            })
        }
        "locked" => {
            let (id,): (String,) = serde_json::from_value(params)?;
            Ok(Notification::Locked(id))
        }
        "stolen" => {
            let (id,): (String,) = serde_json::from_value(params)?;
            Ok(Notification::Stolen(id))
        }
        other => Err(Error::Frame(format!("unknown notification {other:?}"))),
    }
}

/// Monitor context is whatever json-value we sent; we always send the
/// database name, but tolerate anything the server echoes.
fn context_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn error_text(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
