//! Single-gateway session: one WebSocket, many outstanding requests.
//!
//! [`Gateway`] owns at most one live connection to a gateway endpoint. Each
//! connection attempt runs in its own task:
//!
//! ```text
//! disconnected ──connect()──▶ connecting ──challenge + connect ok──▶ connected
//!      ▲                          │                                     │
//!      └──────── socket closed ◀──┴─────────────────────────────────────┘
//!                     │
//!                     └─ not intentional → reconnect after a fixed delay
//! ```
//!
//! Requests are multiplexed over the socket and correlated by a per-instance
//! monotonic id. When a connection goes away every pending request is
//! rejected with [`GatewayError::Disconnected`].
//!
//! Every attempt gets a generation number. A task whose generation is no
//! longer current (superseded by `disconnect()` or a newer attempt) cannot
//! touch the shared state, so there is never more than one live connection
//! handle reachable from a [`Gateway`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::GatewayError;
use crate::protocol::{
    self, events, methods, Attachment, ClientIdentity, ConnectParams, Frame, WireAttachment,
};

/// Default fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default deadline for the `connect` handshake request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Live connection state of a [`Gateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Events emitted by a [`Gateway`], in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Status(ConnectionStatus),
    /// A `chat` or `agent` event frame, payload untouched.
    Chat { event_type: String, payload: Value },
}

/// Tunables for a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub identity: ClientIdentity,
    /// Fixed delay before reconnecting after an unexpected close.
    pub reconnect_delay: Duration,
    /// Deadline for the `connect` handshake. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// Deadline for ordinary requests. `None` (the default) waits until the
    /// response arrives or the connection drops.
    pub request_timeout: Option<Duration>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            request_timeout: None,
        }
    }
}

type Reply = oneshot::Sender<Result<Value, GatewayError>>;

enum Outbound {
    Text(String),
    Close,
}

/// Handle to the connection attempt currently owned by the state machine.
struct Connection {
    generation: u64,
    /// Present once the socket is open.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: JoinHandle<()>,
}

struct State {
    conn: Option<Connection>,
    pending: HashMap<String, Reply>,
    next_id: u64,
    generation: u64,
    intentional_close: bool,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    url: String,
    token: String,
    options: GatewayOptions,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

/// Client session for one gateway endpoint. Cheap to clone; all clones share
/// the same connection.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a disconnected gateway. Status changes and chat events are
    /// delivered on the returned receiver.
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        options: GatewayOptions,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            url: url.into(),
            token: token.into(),
            options,
            state: Mutex::new(State {
                conn: None,
                pending: HashMap::new(),
                next_id: 0,
                generation: 0,
                intentional_close: false,
                reconnect: None,
            }),
            status,
            events,
        });
        (Self { shared }, events_rx)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Wait until the status equals `target`. Returns `false` on timeout.
    pub async fn wait_for_status(&self, target: ConnectionStatus, timeout: Duration) -> bool {
        let mut rx = self.shared.status.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Open the socket and start the handshake. No-op if a connection (open
    /// or still opening) already exists.
    pub async fn connect(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        self.shared.start(&mut state);
    }

    /// Close the connection on purpose: no reconnect, every pending request
    /// rejected, status `Disconnected`.
    pub async fn disconnect(&self) {
        let mut state = self.shared.state.lock().await;
        state.intentional_close = true;
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(conn) = state.conn.take() {
            match conn.outbound {
                Some(tx) => {
                    let _ = tx.send(Outbound::Close);
                }
                None => conn.task.abort(),
            }
            debug!(url = %self.shared.url, "Gateway disconnected by client");
        }
        reject_all(&mut state.pending);
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Send a request and wait for the matching response payload.
    ///
    /// Fails immediately with [`GatewayError::NotConnected`] when there is no
    /// open socket. Requests are never queued.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.shared.request(method, params, None).await
    }

    /// `sessions.list`: the server's sessions.
    pub async fn list_sessions(&self) -> Result<Vec<Value>, GatewayError> {
        let payload = self.request(methods::SESSIONS_LIST, json!({})).await?;
        Ok(extract_list(payload, "sessions"))
    }

    /// `chat.history`: messages of one session.
    pub async fn chat_history(&self, session_key: &str) -> Result<Vec<Value>, GatewayError> {
        let payload = self
            .request(methods::CHAT_HISTORY, json!({ "sessionKey": session_key }))
            .await?;
        Ok(extract_list(payload, "messages"))
    }

    /// `chat.send`. Every call carries a fresh idempotency key.
    pub async fn chat_send(
        &self,
        session_key: &str,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<Value, GatewayError> {
        let mut params = json!({
            "sessionKey": session_key,
            "message": text,
            "idempotencyKey": protocol::idempotency_key(),
        });
        if !attachments.is_empty() {
            let wire: Vec<WireAttachment> = attachments.iter().map(Attachment::to_wire).collect();
            params["attachments"] = serde_json::to_value(wire)?;
        }
        self.request(methods::CHAT_SEND, params).await
    }

    /// `chat.abort`: asks the server to stop generating. Pending local
    /// requests are not affected.
    pub async fn chat_abort(
        &self,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let mut params = json!({ "sessionKey": session_key });
        if let Some(run_id) = run_id {
            params["runId"] = json!(run_id);
        }
        self.request(methods::CHAT_ABORT, params).await?;
        Ok(())
    }

    /// `sessions.delete`
    pub async fn delete_session(&self, session_key: &str) -> Result<(), GatewayError> {
        self.request(methods::SESSIONS_DELETE, json!({ "sessionKey": session_key }))
            .await?;
        Ok(())
    }

    /// `session.update` with a new display name.
    pub async fn rename_session(&self, session_key: &str, name: &str) -> Result<(), GatewayError> {
        self.request(
            methods::SESSION_UPDATE,
            json!({ "sessionKey": session_key, "displayName": name }),
        )
        .await?;
        Ok(())
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        let _ = self.events.send(GatewayEvent::Status(status));
    }

    /// Begin a new connection attempt unless one is already live.
    fn start(self: &Arc<Self>, state: &mut State) {
        if state.conn.is_some() {
            return;
        }
        state.intentional_close = false;
        state.generation += 1;
        let generation = state.generation;
        self.set_status(ConnectionStatus::Connecting);
        let task = tokio::spawn(run_connection(Arc::clone(self), generation));
        state.conn = Some(Connection {
            generation,
            outbound: None,
            task,
        });
    }

    async fn reconnect_now(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        // Dropping our own handle just detaches it.
        state.reconnect = None;
        if state.intentional_close {
            return;
        }
        debug!(url = %self.url, "Reconnecting to gateway");
        self.start(&mut state);
    }

    async fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock().await;
        state.conn.as_ref().map(|c| c.generation) == Some(generation)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        generation: Option<u64>,
    ) -> Result<Value, GatewayError> {
        let (id, rx) = {
            let mut state = self.state.lock().await;
            let outbound = match state.conn.as_ref() {
                Some(c) if generation.is_none_or(|g| g == c.generation) => c.outbound.clone(),
                _ => None,
            }
            .ok_or(GatewayError::NotConnected)?;

            state.next_id += 1;
            let id = state.next_id.to_string();
            let text = protocol::encode(&Frame::request(id.clone(), method, params))?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id.clone(), tx);
            if outbound.send(Outbound::Text(text)).is_err() {
                state.pending.remove(&id);
                return Err(GatewayError::NotConnected);
            }
            trace!(url = %self.url, method, id = %id, "Sent request");
            (id, rx)
        };

        let reply = match self.options.request_timeout {
            Some(limit) if method != methods::CONNECT => {
                if let Ok(reply) = tokio::time::timeout(limit, rx).await {
                    reply
                } else {
                    self.state.lock().await.pending.remove(&id);
                    return Err(GatewayError::Timeout);
                }
            }
            _ => rx.await,
        };
        reply.unwrap_or(Err(GatewayError::Disconnected))
    }

    async fn handle_text(self: &Arc<Self>, text: &str, generation: u64) {
        let Some(frame) = protocol::decode(text) else {
            return;
        };
        match frame {
            Frame::Response(res) => {
                let waiter = self.state.lock().await.pending.remove(&res.id);
                let Some(waiter) = waiter else {
                    debug!(url = %self.url, id = %res.id, "Response for unknown request id");
                    return;
                };
                let result = if res.ok {
                    Ok(res.payload.unwrap_or(Value::Null))
                } else {
                    Err(GatewayError::Rejected(res.error.unwrap_or(Value::Null)))
                };
                let _ = waiter.send(result);
            }
            Frame::Event(ev) if ev.event == events::CONNECT_CHALLENGE => {
                if self.is_current(generation).await {
                    debug!(url = %self.url, "Challenge received, sending connect");
                    tokio::spawn(handshake(Arc::clone(self), generation));
                }
            }
            Frame::Event(ev) if events::is_chat_event(&ev.event) => {
                if self.is_current(generation).await {
                    let _ = self.events.send(GatewayEvent::Chat {
                        event_type: ev.event,
                        payload: ev.payload,
                    });
                }
            }
            Frame::Event(ev) => {
                trace!(url = %self.url, event = %ev.event, "Ignoring gateway event");
            }
            Frame::Request(req) => {
                debug!(url = %self.url, method = %req.method, "Ignoring server-initiated request");
            }
        }
    }

    /// Socket for `generation` is gone. Ignored if that attempt was
    /// superseded; otherwise drains pending requests and schedules exactly one
    /// reconnect unless the close was intentional.
    async fn on_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.conn.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        state.conn = None;
        let drained = reject_all(&mut state.pending);
        self.set_status(ConnectionStatus::Disconnected);

        if state.intentional_close {
            return;
        }
        let delay = self.options.reconnect_delay;
        info!(
            url = %self.url,
            rejected = drained,
            "Gateway connection lost, reconnecting in {}ms",
            delay.as_millis()
        );
        if let Some(old) = state.reconnect.take() {
            old.abort();
        }
        let shared = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.reconnect_now().await;
        }));
    }
}

/// Reject every pending request with `Disconnected`. Returns how many there were.
fn reject_all(pending: &mut HashMap<String, Reply>) -> usize {
    let count = pending.len();
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(GatewayError::Disconnected));
    }
    count
}

/// `payload.<key>` if it is an array, the payload itself if it is an array,
/// otherwise empty.
fn extract_list(payload: Value, key: &str) -> Vec<Value> {
    match payload {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

/// Send the credentialed `connect` request. Success marks the session
/// connected; rejection or timeout closes the socket so the normal
/// disconnect/reconnect path runs.
async fn handshake(shared: Arc<Shared>, generation: u64) {
    let params = match serde_json::to_value(ConnectParams::new(
        &shared.options.identity,
        &shared.token,
    )) {
        Ok(p) => p,
        Err(e) => {
            warn!(url = %shared.url, error = %e, "Failed to encode connect params");
            return;
        }
    };

    let attempt = shared.request(methods::CONNECT, params, Some(generation));
    let result = match shared.options.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or(Err(GatewayError::Timeout)),
        None => attempt.await,
    };

    let state = shared.state.lock().await;
    let Some(conn) = state.conn.as_ref().filter(|c| c.generation == generation) else {
        return;
    };
    match result {
        Ok(_) => {
            info!(url = %shared.url, "Gateway connected");
            shared.set_status(ConnectionStatus::Connected);
        }
        Err(e) => {
            warn!(url = %shared.url, error = %e, "Gateway handshake failed, closing socket");
            if let Some(tx) = &conn.outbound {
                let _ = tx.send(Outbound::Close);
            }
        }
    }
}

/// One connection attempt: open, pump frames until the socket ends, report.
async fn run_connection(shared: Arc<Shared>, generation: u64) {
    let ws = match tokio_tungstenite::connect_async(shared.url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(url = %shared.url, error = %e, "Gateway connect failed");
            shared.on_closed(generation).await;
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    {
        let mut state = shared.state.lock().await;
        match state.conn.as_mut() {
            Some(conn) if conn.generation == generation => conn.outbound = Some(out_tx),
            _ => {
                let _ = sink.close().await;
                return;
            }
        }
    }
    debug!(url = %shared.url, "WebSocket opened, waiting for challenge");

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => shared.handle_text(&text, generation).await,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(url = %shared.url, ?frame, "Gateway closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {} // Binary/Ping/Pong
                    Some(Err(e)) => {
                        warn!(url = %shared.url, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!(url = %shared.url, error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    shared.on_closed(generation).await;
}
