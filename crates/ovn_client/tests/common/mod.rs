//! Scripted OVSDB server for exercising a client end to end.
//!
//! The server speaks just enough of the wire protocol to drive the
//! connect sequence and the monitor stream: canned schemas, a scripted
//! seed reply, recorded transactions, and on-demand update pushes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ovsdb_link::codec::{JsonCodec, RpcMessage};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// Row id the scripted `_Server` Database row lives under.
pub const DATABASE_ROW: &str = "10000000-0000-4000-8000-0000000000aa";

#[derive(Clone)]
enum Push {
    Frame(RpcMessage),
    Close,
}

struct State {
    db: String,
    schema: Value,
    server_schema: Value,
    leader: AtomicBool,
    cond_since: AtomicBool,
    found: AtomicBool,
    last_txn: Mutex<String>,
    /// Delta-shaped seed served by `monitor_cond_since`.
    snapshot: Mutex<Value>,
    /// Old/new-shaped seed served by the classic `monitor`.
    classic: Mutex<Value>,
    transact_replies: Mutex<VecDeque<Value>>,
    transacts: Mutex<Vec<Value>>,
    conns: Mutex<Vec<mpsc::UnboundedSender<Push>>>,
    accepted: AtomicUsize,
}

pub struct MockOvsdb {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockOvsdb {
    pub async fn start(db: &str) -> MockOvsdb {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let state = Arc::new(State {
            db: db.to_owned(),
            schema: nb_schema(),
            server_schema: server_schema(),
            leader: AtomicBool::new(true),
            cond_since: AtomicBool::new(true),
            found: AtomicBool::new(false),
            last_txn: Mutex::new("00000000-0000-0000-0000-000000000000".to_owned()),
            snapshot: Mutex::new(json!({})),
            classic: Mutex::new(json!({})),
            transact_replies: Mutex::new(VecDeque::new()),
            transacts: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_state), stream));
            }
        });
        MockOvsdb { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("tcp:{}", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.state.leader.store(leader, Ordering::SeqCst);
    }

    /// Make `monitor_cond_since` answer "unknown method", as servers
    /// predating it do.
    pub fn disable_cond_since(&self) {
        self.state.cond_since.store(false, Ordering::SeqCst);
    }

    pub fn set_found(&self, found: bool) {
        self.state.found.store(found, Ordering::SeqCst);
    }

    pub fn set_last_txn(&self, txn: &str) {
        *self.state.last_txn.lock().unwrap() = txn.to_owned();
    }

    /// Seed served to the next `monitor_cond_since`, in delta shape.
    pub fn set_snapshot(&self, updates: Value) {
        *self.state.snapshot.lock().unwrap() = updates;
    }

    /// Seed served to the next classic `monitor`, in old/new shape.
    pub fn set_classic_snapshot(&self, updates: Value) {
        *self.state.classic.lock().unwrap() = updates;
    }

    pub fn queue_transact_reply(&self, results: Value) {
        self.state.transact_replies.lock().unwrap().push_back(results);
    }

    /// Transact params recorded so far, oldest first. Each entry is the
    /// raw params array: database name followed by the operations.
    pub fn transacts(&self) -> Vec<Value> {
        self.state.transacts.lock().unwrap().clone()
    }

    /// Stream one `update3` to every live connection and remember its
    /// cursor for later resumes.
    pub fn push_update3(&self, last_txn: &str, updates: Value) {
        *self.state.last_txn.lock().unwrap() = last_txn.to_owned();
        let note =
            RpcMessage::notification("update3", json!([self.state.db, last_txn, updates]));
        self.state.broadcast(Push::Frame(note));
    }

    /// Flip the advertised leadership and stream the change through the
    /// `_Server` monitor.
    pub fn push_leadership(&self, leader: bool) {
        self.state.leader.store(leader, Ordering::SeqCst);
        let note = RpcMessage::notification(
            "update2",
            json!([
                "_Server",
                { "Database": { DATABASE_ROW: { "modify": { "leader": leader } } } }
            ]),
        );
        self.state.broadcast(Push::Frame(note));
    }

    /// Hard-close every live connection, as a crashing server would.
    pub fn drop_connections(&self) {
        self.state.broadcast(Push::Close);
    }
}

impl State {
    fn broadcast(&self, push: Push) {
        let mut conns = self.conns.lock().unwrap();
        conns.retain(|tx| tx.send(push.clone()).is_ok());
    }

    fn answer(&self, msg: &RpcMessage) -> Option<RpcMessage> {
        if !msg.is_request() {
            return None;
        }
        let id = msg.id.clone();
        let method = msg.method.as_deref().unwrap_or_default();
        let params = msg.params.clone().unwrap_or_else(|| json!([]));
        match method {
            "get_schema" => {
                let db = params.get(0).and_then(Value::as_str).unwrap_or_default();
                let schema = if db == "_Server" {
                    self.server_schema.clone()
                } else {
                    self.schema.clone()
                };
                Some(RpcMessage::response(id, schema))
            }
            "monitor_cond_since" => {
                if !self.cond_since.load(Ordering::SeqCst) {
                    return Some(error_reply(id, "unknown method"));
                }
                let found = self.found.load(Ordering::SeqCst);
                let last_txn = self.last_txn.lock().unwrap().clone();
                let updates = self.snapshot.lock().unwrap().clone();
                Some(RpcMessage::response(id, json!([found, last_txn, updates])))
            }
            "monitor" => {
                let dump = self.classic.lock().unwrap().clone();
                Some(RpcMessage::response(id, dump))
            }
            "monitor_cond" => {
                let dump = json!({
                    "Database": {
                        DATABASE_ROW: {
                            "initial": {
                                "name": self.db,
                                "model": "clustered",
                                "leader": self.leader.load(Ordering::SeqCst),
                                "connected": true,
                            }
                        }
                    }
                });
                Some(RpcMessage::response(id, dump))
            }
            "monitor_cancel" => Some(RpcMessage::response(id, json!({}))),
            "transact" => {
                self.transacts.lock().unwrap().push(params.clone());
                let reply = self
                    .transact_replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| {
                        let ops = params
                            .as_array()
                            .map(|a| a.len().saturating_sub(1))
                            .unwrap_or(0);
                        Value::Array(vec![json!({}); ops])
                    });
                Some(RpcMessage::response(id, reply))
            }
            "echo" => Some(RpcMessage::response(id, params)),
            _ => Some(error_reply(id, "unknown method")),
        }
    }
}

async fn serve(state: Arc<State>, stream: TcpStream) {
    let mut framed = Framed::new(stream, JsonCodec);
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.conns.lock().unwrap().push(tx);
    loop {
        tokio::select! {
            pushed = rx.recv() => match pushed {
                Some(Push::Frame(msg)) => {
                    if framed.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Push::Close) | None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(msg)) => {
                    if let Some(reply) = state.answer(&msg) {
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                _ => break,
            },
        }
    }
}

fn error_reply(id: Value, message: &str) -> RpcMessage {
    RpcMessage {
        method: None,
        params: None,
        result: None,
        error: Some(json!(message)),
        id,
    }
}

/// An endpoint nothing listens on: bind a port, remember it, release it.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);
    format!("tcp:{addr}")
}

/// Poll `probe` until it reports true or a generous deadline passes.
pub async fn wait_until<F, Fut>(mut probe: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn scalar(atom: &str) -> Value {
    json!({ "type": atom })
}

fn optional(atom: &str) -> Value {
    json!({ "type": { "key": atom, "min": 0, "max": 1 } })
}

fn string_set() -> Value {
    json!({ "type": { "key": "string", "min": 0, "max": "unlimited" } })
}

fn uuid_set(ref_table: &str) -> Value {
    json!({
        "type": {
            "key": { "type": "uuid", "refTable": ref_table },
            "min": 0,
            "max": "unlimited",
        }
    })
}

fn string_map() -> Value {
    json!({
        "type": { "key": "string", "value": "string", "min": 0, "max": "unlimited" }
    })
}

/// Northbound schema covering the replicated tables, shaped like the
/// real one but trimmed to the columns the client touches.
pub fn nb_schema() -> Value {
    json!({
        "name": "OVN_Northbound",
        "version": "5.16.0",
        "tables": {
            "Logical_Switch": {
                "isRoot": true,
                "columns": {
                    "name": scalar("string"),
                    "ports": uuid_set("Logical_Switch_Port"),
                    "acls": uuid_set("ACL"),
                    "load_balancer": uuid_set("Load_Balancer"),
                    "other_config": string_map(),
                    "external_ids": string_map(),
                }
            },
            "Logical_Switch_Port": {
                "columns": {
                    "name": scalar("string"),
                    "type": scalar("string"),
                    "addresses": string_set(),
                    "port_security": string_set(),
                    "up": optional("boolean"),
                    "enabled": optional("boolean"),
                    "dynamic_addresses": optional("string"),
                    "dhcpv4_options": optional("uuid"),
                    "tag": { "type": { "key": { "type": "integer", "minInteger": 1, "maxInteger": 4095 }, "min": 0, "max": 1 } },
                    "options": string_map(),
                    "external_ids": string_map(),
                }
            },
            "ACL": {
                "columns": {
                    "name": optional("string"),
                    "priority": { "type": { "key": { "type": "integer", "minInteger": 0, "maxInteger": 32767 } } },
                    "direction": scalar("string"),
                    "match": scalar("string"),
                    "action": scalar("string"),
                    "log": scalar("boolean"),
                    "severity": optional("string"),
                    "external_ids": string_map(),
                }
            },
            "Address_Set": {
                "isRoot": true,
                "columns": {
                    "name": scalar("string"),
                    "addresses": string_set(),
                    "external_ids": string_map(),
                }
            },
            "Load_Balancer": {
                "isRoot": true,
                "columns": {
                    "name": scalar("string"),
                    "vips": string_map(),
                    "protocol": optional("string"),
                    "external_ids": string_map(),
                }
            },
            "Logical_Router": {
                "isRoot": true,
                "columns": {
                    "name": scalar("string"),
                    "ports": uuid_set("Logical_Router_Port"),
                    "static_routes": uuid_set("Logical_Router_Static_Route"),
                    "nat": uuid_set("NAT"),
                    "load_balancer": uuid_set("Load_Balancer"),
                    "options": string_map(),
                    "external_ids": string_map(),
                }
            },
            "Logical_Router_Port": {
                "columns": {
                    "name": scalar("string"),
                    "mac": scalar("string"),
                    "networks": { "type": { "key": "string", "min": 1, "max": "unlimited" } },
                    "peer": optional("string"),
                    "enabled": optional("boolean"),
                    "external_ids": string_map(),
                }
            },
        }
    })
}

pub fn server_schema() -> Value {
    json!({
        "name": "_Server",
        "version": "1.1.0",
        "tables": {
            "Database": {
                "columns": {
                    "name": scalar("string"),
                    "model": scalar("string"),
                    "leader": scalar("boolean"),
                    "connected": scalar("boolean"),
                    "index": optional("integer"),
                }
            }
        }
    })
}
