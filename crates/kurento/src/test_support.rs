// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scriptable in-process KMS stand-in for tests.
//!
//! [`FakeKms`] listens on an ephemeral port, speaks just enough of the KMS
//! JSON-RPC dialect to satisfy the transport, records every request it sees,
//! and lets tests inject `onEvent` notifications or misbehave on demand
//! (reordered replies, error replies, missing session ids, silence).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Knobs for misbehaving like a real-world KMS sometimes does.
#[derive(Debug, Clone, Default)]
pub struct FakeKmsOptions {
    /// Buffer `create` replies in pairs and send each pair reversed.
    pub reorder_create_replies: bool,
    /// Answer this method (or invoke operation) with a JSON-RPC error.
    pub fail_method: Option<String>,
    /// Leave `sessionId` out of every `result`.
    pub omit_session_id: bool,
    /// Record requests but never answer them.
    pub silent: bool,
}

#[derive(Default)]
struct Counters {
    replies: AtomicU64,
    objects: AtomicU64,
    subscriptions: AtomicU64,
}

/// Handle to a running fake KMS server.
pub struct FakeKms {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    created: Arc<Mutex<Vec<(String, String)>>>,
    conn_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: CancellationToken,
}

impl FakeKms {
    /// Start a well-behaved fake KMS on an ephemeral port.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with(FakeKmsOptions::default()).await
    }

    /// Start a fake KMS with the given behavior.
    pub async fn spawn_with(opts: FakeKmsOptions) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::new(Mutex::new(Vec::new()));
        let conn_tx = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            opts,
            Arc::new(Counters::default()),
            Arc::clone(&requests),
            Arc::clone(&created),
            Arc::clone(&conn_tx),
            shutdown.clone(),
        ));

        Ok(Self {
            addr,
            requests,
            created,
            conn_tx,
            shutdown,
        })
    }

    /// The `ws://` URL the transport should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    /// Requests whose `method` matches.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.get("method").and_then(Value::as_str) == Some(method))
            .cloned()
            .collect()
    }

    /// `invoke` requests whose operation matches.
    pub fn invocations_of(&self, operation: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|r| {
                r.get("method").and_then(Value::as_str) == Some("invoke")
                    && r.pointer("/params/operation").and_then(Value::as_str) == Some(operation)
            })
            .cloned()
            .collect()
    }

    /// `(type, object id)` pairs in creation order.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().clone()
    }

    /// Object ids created with the given remote type, in creation order.
    pub fn created_of(&self, object_type: &str) -> Vec<String> {
        self.created
            .lock()
            .iter()
            .filter(|(ty, _)| ty == object_type)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Wait until at least `n` requests arrived.
    pub async fn wait_for_requests(&self, n: usize) -> anyhow::Result<Vec<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.requests();
            if snapshot.len() >= n {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("saw {} of {n} expected requests", snapshot.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Push a raw notification frame to the connected client.
    pub fn send_event(&self, notification: Value) -> anyhow::Result<()> {
        let guard = self.conn_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no client connected"))?;
        tx.send(notification.to_string())
            .map_err(|_| anyhow::anyhow!("client connection gone"))
    }

    /// An `IceCandidateFound` notification for the given source object.
    pub fn ice_candidate_event(source: &str, candidate: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "onEvent",
            "params": {
                "value": {
                    "data": {
                        "type": "IceCandidateFound",
                        "source": source,
                        "candidate": {
                            "candidate": candidate,
                            "sdpMid": "0",
                            "sdpMLineIndex": 0,
                        },
                    },
                },
            },
        })
    }
}

impl Drop for FakeKms {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    opts: FakeKmsOptions,
    counters: Arc<Counters>,
    requests: Arc<Mutex<Vec<Value>>>,
    created: Arc<Mutex<Vec<(String, String)>>>,
    conn_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_conn(
                        stream,
                        opts.clone(),
                        Arc::clone(&counters),
                        Arc::clone(&requests),
                        Arc::clone(&created),
                        Arc::clone(&conn_tx),
                        shutdown.clone(),
                    ));
                }
                Err(_) => break,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_conn(
    stream: TcpStream,
    opts: FakeKmsOptions,
    counters: Arc<Counters>,
    requests: Arc<Mutex<Vec<Value>>>,
    created: Arc<Mutex<Vec<(String, String)>>>,
    conn_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: CancellationToken,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *conn_tx.lock() = Some(out_tx.clone());

    // Reorder buffer for `create` replies when the option is on.
    let mut held: Vec<Value> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            out = out_rx.recv() => match out {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    requests.lock().push(request.clone());
                    if opts.silent {
                        continue;
                    }
                    let reply = build_reply(&request, &opts, &counters, &created);
                    let is_create =
                        request.get("method").and_then(Value::as_str) == Some("create");
                    if opts.reorder_create_replies && is_create {
                        held.push(reply);
                        if held.len() == 2 {
                            for r in held.drain(..).rev() {
                                let _ = out_tx.send(r.to_string());
                            }
                        }
                    } else {
                        let _ = out_tx.send(reply.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

fn build_reply(
    request: &Value,
    opts: &FakeKmsOptions,
    counters: &Counters,
    created: &Mutex<Vec<(String, String)>>,
) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let operation = request
        .pointer("/params/operation")
        .and_then(Value::as_str);

    if let Some(ref target) = opts.fail_method {
        if target == method || Some(target.as_str()) == operation {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": 40001, "message": format!("{target} rejected") },
            });
        }
    }

    let reply_no = counters.replies.fetch_add(1, Ordering::Relaxed) + 1;
    let value = match method {
        "create" => {
            let object_id = format!("obj-{}", counters.objects.fetch_add(1, Ordering::Relaxed) + 1);
            let object_type = request
                .pointer("/params/type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            created.lock().push((object_type.to_owned(), object_id.clone()));
            Some(Value::String(object_id))
        }
        "subscribe" => Some(Value::String(format!(
            "sub-{}",
            counters.subscriptions.fetch_add(1, Ordering::Relaxed) + 1
        ))),
        "invoke" => match operation {
            Some("processOffer") => {
                let offer = request
                    .pointer("/params/operationParams/offer")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(Value::String(format!("answer:{offer}")))
            }
            Some("generateOffer") => Some(Value::String(format!("offer-{reply_no}"))),
            _ => None,
        },
        _ => None,
    };

    let mut result = serde_json::Map::new();
    if !opts.omit_session_id {
        result.insert(
            "sessionId".to_owned(),
            Value::String(format!("sess-{reply_no}")),
        );
    }
    if let Some(value) = value {
        result.insert("value".to_owned(), value);
    }
    json!({ "jsonrpc": "2.0", "id": id, "result": Value::Object(result) })
}
