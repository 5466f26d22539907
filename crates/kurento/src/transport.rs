// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC 2.0 transport to a Kurento Media Server over a single
//! multiplexed WebSocket.
//!
//! Three tasks run per connection:
//! - a **writer** draining an outbound channel into the socket,
//! - a **receiver** correlating responses to pending requests by id and
//!   pushing notifications onto a bounded event queue,
//! - a **dispatcher** draining that queue into subscription handlers.
//!
//! The event queue is bounded (default 64). When it fills, the receiver
//! blocks, which backpressures the KMS socket instead of dropping events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{KurentoError, Result};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Handler invoked with the `params.value` payload of a matching `onEvent`
/// notification. Handlers run on the dispatcher task and must not block;
/// forwarding through an unbounded channel is the expected shape.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Tunables for the KMS connection.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Deadline for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Deadline for a single RPC round trip. `None` waits forever.
    pub rpc_timeout: Option<Duration>,
    /// Capacity of the notification queue between receiver and dispatcher.
    pub event_queue_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Some(Duration::from_secs(30)),
            event_queue_size: 64,
        }
    }
}

/// A registered event subscription.
struct Subscription {
    event_type: String,
    object_id: String,
    handler: EventHandler,
}

/// Subscriptions held in two views that always mutate together: an id-keyed
/// map and an event-type index used by the dispatcher.
#[derive(Default)]
struct SubscriptionMap {
    by_id: HashMap<String, Subscription>,
    by_type: HashMap<String, Vec<String>>,
}

impl SubscriptionMap {
    fn insert(&mut self, id: String, subscription: Subscription) {
        self.by_type
            .entry(subscription.event_type.clone())
            .or_default()
            .push(id.clone());
        self.by_id.insert(id, subscription);
    }

    fn remove(&mut self, id: &str) -> Option<Subscription> {
        let subscription = self.by_id.remove(id)?;
        if let Some(ids) = self.by_type.get_mut(&subscription.event_type) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                self.by_type.remove(&subscription.event_type);
            }
        }
        Some(subscription)
    }

    fn rekey(&mut self, old: &str, new: &str) {
        if let Some(subscription) = self.remove(old) {
            self.insert(new.to_owned(), subscription);
        }
    }

    /// Handlers registered for an event type, paired with the object each
    /// subscription targets.
    fn handlers_for(&self, event_type: &str) -> Vec<(String, EventHandler)> {
        let Some(ids) = self.by_type.get(event_type) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .map(|s| (s.object_id.clone(), Arc::clone(&s.handler)))
            .collect()
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// The single multiplexed connection to KMS.
///
/// Connects lazily: the socket is (re)established on the first RPC after
/// construction or after a disconnect, bounded by
/// [`TransportOptions::connect_timeout`]. All in-flight RPCs fail with
/// [`KurentoError::TransportClosed`] when the socket ends.
pub struct KurentoTransport {
    url: String,
    opts: TransportOptions,
    next_id: AtomicU64,
    next_local_sub: AtomicU64,
    session: Arc<Mutex<Option<String>>>,
    pending: Arc<Mutex<PendingMap>>,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    conn: tokio::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
}

impl KurentoTransport {
    /// Create a transport that will connect on first use.
    pub fn new(url: impl Into<String>, opts: TransportOptions) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            opts,
            next_id: AtomicU64::new(1),
            next_local_sub: AtomicU64::new(1),
            session: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(SubscriptionMap::default())),
            conn: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a transport and establish the connection eagerly.
    pub async fn connect(url: impl Into<String>, opts: TransportOptions) -> Result<Arc<Self>> {
        let transport = Self::new(url, opts);
        transport.ensure_connected().await?;
        Ok(transport)
    }

    /// The session token KMS issued on the first successful RPC, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().clone()
    }

    /// Stop the connection tasks. In-flight RPCs resolve with
    /// [`KurentoError::TransportClosed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// `create` RPC: instantiate a KMS object, returning its object id.
    pub async fn create(
        &self,
        object_type: &str,
        constructor_params: Map<String, Value>,
    ) -> Result<String> {
        let mut params = Map::new();
        params.insert("type".to_owned(), Value::String(object_type.to_owned()));
        params.insert(
            "constructorParams".to_owned(),
            Value::Object(constructor_params),
        );
        let result = self.rpc("create", params).await?;
        match result.get("value").and_then(Value::as_str) {
            Some(object_id) => Ok(object_id.to_owned()),
            None => Err(KurentoError::Protocol(format!(
                "create {object_type} returned no object id"
            ))),
        }
    }

    /// `invoke` RPC: call an operation on an existing KMS object.
    pub async fn invoke(
        &self,
        object_id: &str,
        operation: &str,
        operation_params: Map<String, Value>,
    ) -> Result<Option<Value>> {
        let mut params = Map::new();
        params.insert("object".to_owned(), Value::String(object_id.to_owned()));
        params.insert("operation".to_owned(), Value::String(operation.to_owned()));
        params.insert(
            "operationParams".to_owned(),
            Value::Object(operation_params),
        );
        let result = self.rpc("invoke", params).await?;
        Ok(result.get("value").cloned())
    }

    /// `subscribe` RPC: register `handler` for `event_type` on an object.
    ///
    /// The handler is registered locally under a provisional id *before* the
    /// RPC goes out, then re-keyed to the KMS subscription id, so an event
    /// arriving between the ack and registration cannot be missed. The
    /// handler may fire any time after this returns.
    pub async fn subscribe(
        &self,
        object_id: &str,
        event_type: &str,
        handler: EventHandler,
    ) -> Result<String> {
        let provisional = format!(
            "local-{}",
            self.next_local_sub.fetch_add(1, Ordering::Relaxed)
        );
        self.subscriptions.lock().insert(
            provisional.clone(),
            Subscription {
                event_type: event_type.to_owned(),
                object_id: object_id.to_owned(),
                handler,
            },
        );

        let mut params = Map::new();
        params.insert("object".to_owned(), Value::String(object_id.to_owned()));
        params.insert("type".to_owned(), Value::String(event_type.to_owned()));

        match self.rpc("subscribe", params).await {
            Ok(result) => match result.get("value").and_then(Value::as_str) {
                Some(subscription_id) => {
                    self.subscriptions.lock().rekey(&provisional, subscription_id);
                    Ok(subscription_id.to_owned())
                }
                None => {
                    self.subscriptions.lock().remove(&provisional);
                    Err(KurentoError::Protocol(
                        "subscribe returned no subscription id".to_owned(),
                    ))
                }
            },
            Err(e) => {
                self.subscriptions.lock().remove(&provisional);
                Err(e)
            }
        }
    }

    /// `unsubscribe` RPC. The local handler mappings are removed first, so
    /// the handler stops firing even if the RPC fails.
    pub async fn unsubscribe(&self, object_id: &str, subscription_id: &str) -> Result<()> {
        self.subscriptions.lock().remove(subscription_id);
        let mut params = Map::new();
        params.insert("object".to_owned(), Value::String(object_id.to_owned()));
        params.insert(
            "subscription".to_owned(),
            Value::String(subscription_id.to_owned()),
        );
        self.rpc("unsubscribe", params).await.map(|_| ())
    }

    /// `release` RPC: destroy a KMS object.
    pub async fn release(&self, object_id: &str) -> Result<()> {
        let mut params = Map::new();
        params.insert("object".to_owned(), Value::String(object_id.to_owned()));
        self.rpc("release", params).await.map(|_| ())
    }

    /// Issue one JSON-RPC request and await its correlated response.
    ///
    /// Returns the `result` object of a successful response. The session
    /// token is attached to `params` once known and refreshed from every
    /// response by the receiver.
    async fn rpc(&self, method: &str, mut params: Map<String, Value>) -> Result<Value> {
        let outbound = self.ensure_connected().await?;

        if let Some(session_id) = self.session_id() {
            params.insert("sessionId".to_owned(), Value::String(session_id));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": Value::Object(params),
        });
        tracing::debug!(id, method, "KMS request");
        if outbound.send(frame.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(KurentoError::TransportClosed);
        }

        let outcome = match self.opts.rpc_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(done) => done,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(KurentoError::RpcTimeout {
                        method: method.to_owned(),
                    });
                }
            },
            None => rx.await,
        };
        // A dropped sender means the receiver exited before answering.
        outcome.unwrap_or(Err(KurentoError::TransportClosed))
    }

    /// Return the live outbound sender, reconnecting if the socket is gone.
    async fn ensure_connected(&self) -> Result<mpsc::UnboundedSender<String>> {
        let mut guard = self.conn.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        tracing::info!(url = %self.url, "connecting to KMS");
        let attempt = tokio_tungstenite::connect_async(&self.url);
        let (socket, _) = match tokio::time::timeout(self.opts.connect_timeout, attempt).await {
            Err(_) => {
                return Err(KurentoError::ConnectTimeout {
                    url: self.url.clone(),
                })
            }
            Ok(Err(e)) => {
                return Err(KurentoError::Connect {
                    url: self.url.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Ok(pair)) => pair,
        };
        tracing::info!(url = %self.url, "KMS connection established");

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.opts.event_queue_size.max(1));
        let conn_token = self.shutdown.child_token();

        tokio::spawn(writer_loop(sink, outbound_rx, conn_token.clone()));
        tokio::spawn(receiver_loop(
            stream,
            event_tx,
            Arc::clone(&self.pending),
            Arc::clone(&self.session),
            conn_token.clone(),
        ));
        tokio::spawn(dispatcher_loop(
            event_rx,
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.session),
            conn_token,
        ));

        *guard = Some(outbound_tx.clone());
        Ok(outbound_tx)
    }
}

impl Drop for KurentoTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drain the outbound channel into the socket.
async fn writer_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    conn_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,

            msg = outbound_rx.recv() => match msg {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        tracing::debug!("KMS socket write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    conn_token.cancel();
    let _ = sink.close().await;
}

/// Read frames in order, resolving responses and queueing notifications.
/// On exit every in-flight RPC fails with `TransportClosed`.
async fn receiver_loop(
    mut stream: SplitStream<WsStream>,
    event_tx: mpsc::Sender<Value>,
    pending: Arc<Mutex<PendingMap>>,
    session: Arc<Mutex<Option<String>>>,
    conn_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(text.as_str(), &event_tx, &pending, &session).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("KMS socket closed");
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(err = %e, "KMS socket error");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary ignored
            }
        }
    }
    conn_token.cancel();

    let waiters: Vec<_> = pending.lock().drain().map(|(_, tx)| tx).collect();
    for tx in waiters {
        let _ = tx.send(Err(KurentoError::TransportClosed));
    }
}

/// Classify one inbound frame: a frame carrying an `id` plus `result` or
/// `error` is a response; everything else is a notification.
async fn handle_frame(
    text: &str,
    event_tx: &mpsc::Sender<Value>,
    pending: &Mutex<PendingMap>,
    session: &Mutex<Option<String>>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(err = %e, "dropping malformed KMS frame");
            return;
        }
    };

    let id = frame.get("id").and_then(Value::as_u64);
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();
    match (id, is_reply) {
        (Some(id), true) => resolve_pending(id, frame, pending, session),
        _ => {
            // A full queue blocks here, backpressuring the KMS socket
            // rather than dropping events.
            if event_tx.send(frame).await.is_err() {
                tracing::debug!("event dispatcher gone, dropping notification");
            }
        }
    }
}

/// Complete the pending RPC keyed by `id`, exactly once.
fn resolve_pending(
    id: u64,
    frame: Value,
    pending: &Mutex<PendingMap>,
    session: &Mutex<Option<String>>,
) {
    let Some(waiter) = pending.lock().remove(&id) else {
        tracing::debug!(id, "response for unknown request id");
        return;
    };

    let outcome = if let Some(error) = frame.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown KMS error")
            .to_owned();
        Err(KurentoError::Rpc {
            message,
            envelope: frame,
        })
    } else {
        let result = frame.get("result").cloned().unwrap_or(Value::Null);
        match result.get("sessionId").and_then(Value::as_str) {
            Some(session_id) => {
                *session.lock() = Some(session_id.to_owned());
                Ok(result)
            }
            None => Err(KurentoError::Protocol(format!(
                "response {id} carries no result.sessionId"
            ))),
        }
    };

    if waiter.send(outcome).is_err() {
        tracing::debug!(id, "caller gave up before the response arrived");
    }
}

/// Drain the event queue into subscription handlers, preserving order.
async fn dispatcher_loop(
    mut event_rx: mpsc::Receiver<Value>,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    session: Arc<Mutex<Option<String>>>,
    conn_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,

            frame = event_rx.recv() => match frame {
                Some(frame) => dispatch_event(frame, &subscriptions, &session),
                None => break,
            }
        }
    }
}

/// Invoke every handler registered for the notification's event type with
/// the full `params.value` payload.
fn dispatch_event(
    frame: Value,
    subscriptions: &Mutex<SubscriptionMap>,
    session: &Mutex<Option<String>>,
) {
    let method = frame.get("method").and_then(Value::as_str);
    if method != Some("onEvent") {
        tracing::debug!(method, "ignoring notification");
        return;
    }
    let Some(params) = frame.get("params") else {
        tracing::warn!("onEvent notification without params");
        return;
    };
    if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
        *session.lock() = Some(session_id.to_owned());
    }
    let Some(value) = params.get("value") else {
        tracing::warn!("onEvent notification without value");
        return;
    };
    let Some(event_type) = value.pointer("/data/type").and_then(Value::as_str) else {
        tracing::warn!("onEvent notification without data.type");
        return;
    };

    // Clone the handler list out so no lock is held while user code runs.
    let handlers = subscriptions.lock().handlers_for(event_type);
    if handlers.is_empty() {
        tracing::debug!(event_type, "no subscribers for event");
        return;
    }
    for (object, handler) in handlers {
        tracing::trace!(event_type, object = %object, "dispatching event");
        handler(value);
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
