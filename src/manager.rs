//! Multi-gateway registry and routing.
//!
//! [`GatewayManager`] owns one [`GatewayConfig`] per configured gateway and, for
//! gateways that have been asked to connect, one live [`Gateway`] session. It
//! merges the per-gateway event streams into a single broadcast stream of
//! [`ManagerEvent`]s, each tagged with the originating gateway id.
//!
//! Routing rules:
//!
//! - Calls that name a gateway id fail with [`ManagerError::UnknownGateway`] or
//!   [`ManagerError::NotConnected`]. They never fall back to another gateway.
//! - [`GatewayManager::chat_send`] without an id goes to
//!   [`GatewayManager::first_connected`], which is the first connected gateway
//!   in registration order.
//! - [`GatewayManager::list_sessions`] without an id fans out to every
//!   connected gateway and skips the ones that fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, ManagerError};
use crate::gateway::{ConnectionStatus, Gateway, GatewayEvent, GatewayOptions};
use crate::protocol::Attachment;
use crate::store::{ConfigStore, GatewayConfig, GatewayStatus};
use crate::util;

/// Buffered manager events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Event on the merged manager stream.
///
/// Serializes as `{"type", "gatewayId", "payload"}`. Payloads per type:
/// `statusChange` `{status}`, `chatEvent` `{eventType, payload}` with the
/// gateway payload untouched, `gatewayAdded` the config, `gatewayRemoved`
/// `{}`, `error` `{message}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    StatusChange {
        gateway_id: String,
        status: GatewayStatus,
    },
    /// A `chat` or `agent` event, payload unchanged.
    ChatEvent {
        gateway_id: String,
        event_type: String,
        payload: Value,
    },
    GatewayAdded {
        gateway_id: String,
        config: GatewayConfig,
    },
    GatewayRemoved {
        gateway_id: String,
    },
    Error {
        gateway_id: String,
        message: String,
    },
}

impl ManagerEvent {
    pub fn gateway_id(&self) -> &str {
        match self {
            Self::StatusChange { gateway_id, .. }
            | Self::ChatEvent { gateway_id, .. }
            | Self::GatewayAdded { gateway_id, .. }
            | Self::GatewayRemoved { gateway_id }
            | Self::Error { gateway_id, .. } => gateway_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::StatusChange { .. } => "statusChange",
            Self::ChatEvent { .. } => "chatEvent",
            Self::GatewayAdded { .. } => "gatewayAdded",
            Self::GatewayRemoved { .. } => "gatewayRemoved",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    gateway_id: &'a str,
    payload: WirePayload<'a>,
}

#[derive(Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
enum WirePayload<'a> {
    Status { status: GatewayStatus },
    Chat { event_type: &'a str, payload: &'a Value },
    Config(&'a GatewayConfig),
    Message { message: &'a str },
    Empty {},
}

impl Serialize for ManagerEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match self {
            Self::StatusChange { status, .. } => WirePayload::Status { status: *status },
            Self::ChatEvent {
                event_type,
                payload,
                ..
            } => WirePayload::Chat {
                event_type,
                payload,
            },
            Self::GatewayAdded { config, .. } => WirePayload::Config(config),
            Self::GatewayRemoved { .. } => WirePayload::Empty {},
            Self::Error { message, .. } => WirePayload::Message { message },
        };
        WireEvent {
            kind: self.kind(),
            gateway_id: self.gateway_id(),
            payload,
        }
        .serialize(serializer)
    }
}

/// Partial update for [`GatewayManager::update_gateway`]. `None` leaves a field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct GatewayUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub role: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
}

/// A session returned by a fan-out `sessions.list`, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedSession {
    pub gateway_id: String,
    pub session: Value,
}

struct Live {
    gateway: Gateway,
    forwarder: JoinHandle<()>,
}

impl Live {
    async fn shutdown(self) {
        self.forwarder.abort();
        self.gateway.disconnect().await;
    }
}

#[derive(Default)]
struct Registry {
    initialized: bool,
    /// Registration order is the iteration order.
    configs: IndexMap<String, GatewayConfig>,
    live: HashMap<String, Live>,
}

struct Inner {
    store: Arc<dyn ConfigStore>,
    options: GatewayOptions,
    registry: RwLock<Registry>,
    events: broadcast::Sender<ManagerEvent>,
}

/// Registry of gateways plus the merged event stream. Cheap to clone.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<Inner>,
}

impl GatewayManager {
    pub fn new(store: Arc<dyn ConfigStore>, options: GatewayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                options,
                registry: RwLock::new(Registry::default()),
                events,
            }),
        }
    }

    /// Load persisted configs with their status reset to `disconnected`.
    /// Later calls return the cached set without touching the store.
    pub async fn initialize(&self) -> Result<Vec<GatewayConfig>, ManagerError> {
        let mut reg = self.inner.registry.write().await;
        if !reg.initialized {
            let loaded = self.inner.store.load_gateways().await?;
            for mut config in loaded {
                config.status = GatewayStatus::Disconnected;
                config.error = None;
                reg.configs.entry(config.id.clone()).or_insert(config);
            }
            reg.initialized = true;
            info!(gateways = reg.configs.len(), "Gateway manager initialized");
        }
        Ok(reg.configs.values().cloned().collect())
    }

    /// Independent receiver of every manager event from now on.
    ///
    /// Each receiver buffers up to 256 events. One that falls further behind
    /// loses the oldest ones and its next `recv()` returns
    /// [`broadcast::error::RecvError::Lagged`] with the number skipped.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every config, in registration order.
    pub async fn configs(&self) -> Vec<GatewayConfig> {
        self.inner.registry.read().await.configs.values().cloned().collect()
    }

    pub async fn config(&self, id: &str) -> Option<GatewayConfig> {
        self.inner.registry.read().await.configs.get(id).cloned()
    }

    /// The live session for `id`, if one has been started.
    pub async fn gateway(&self, id: &str) -> Option<Gateway> {
        let reg = self.inner.registry.read().await;
        reg.live.get(id).map(|l| l.gateway.clone())
    }

    /// Every connected gateway, in registration order.
    pub async fn connected(&self) -> Vec<(String, Gateway)> {
        let reg = self.inner.registry.read().await;
        reg.configs
            .keys()
            .filter_map(|id| {
                let live = reg.live.get(id)?;
                (live.gateway.status() == ConnectionStatus::Connected)
                    .then(|| (id.clone(), live.gateway.clone()))
            })
            .collect()
    }

    /// First connected gateway in registration order. Default target for
    /// [`Self::chat_send`] when no id is given.
    pub async fn first_connected(&self) -> Option<(String, Gateway)> {
        self.connected().await.into_iter().next()
    }

    /// `connected` if any gateway is, else `connecting` if any is, else
    /// `disconnected`.
    pub async fn overall_status(&self) -> ConnectionStatus {
        let reg = self.inner.registry.read().await;
        let statuses: Vec<ConnectionStatus> =
            reg.live.values().map(|l| l.gateway.status()).collect();
        if statuses.contains(&ConnectionStatus::Connected) {
            ConnectionStatus::Connected
        } else if statuses.contains(&ConnectionStatus::Connecting) {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// Register and persist a gateway, then optionally connect it. An existing
    /// gateway with the same id is replaced and its session torn down.
    pub async fn add_gateway(
        &self,
        mut config: GatewayConfig,
        auto_connect: bool,
    ) -> Result<GatewayConfig, ManagerError> {
        check_url(&config)?;
        config.status = GatewayStatus::Disconnected;
        config.error = None;
        self.inner.store.save_gateway(&config).await?;

        let replaced = {
            let mut reg = self.inner.registry.write().await;
            reg.configs.insert(config.id.clone(), config.clone());
            reg.live.remove(&config.id)
        };
        if let Some(old) = replaced {
            old.shutdown().await;
        }
        info!(gateway = %config.id, url = %config.url, "Gateway added");
        self.inner.emit(ManagerEvent::GatewayAdded {
            gateway_id: config.id.clone(),
            config: config.clone(),
        });

        if auto_connect {
            self.connect(&config.id).await?;
        }
        Ok(config)
    }

    /// Apply a partial update. Changing the URL or token of a gateway with a
    /// live session restarts it with the new credentials.
    pub async fn update_gateway(
        &self,
        id: &str,
        update: GatewayUpdate,
    ) -> Result<GatewayConfig, ManagerError> {
        let (updated, restart) = {
            let mut reg = self.inner.registry.write().await;
            let config = reg
                .configs
                .get_mut(id)
                .ok_or_else(|| ManagerError::UnknownGateway(id.to_string()))?;

            let mut candidate = config.clone();
            let credentials_changed = update.url.as_ref().is_some_and(|u| *u != candidate.url)
                || update.token.as_ref().is_some_and(|t| *t != candidate.token);
            if let Some(name) = update.name {
                candidate.name = name;
            }
            if let Some(url) = update.url {
                candidate.url = url;
            }
            if let Some(token) = update.token {
                candidate.token = token;
            }
            if update.role.is_some() {
                candidate.role = update.role;
            }
            if update.avatar.is_some() {
                candidate.avatar = update.avatar;
            }
            if update.description.is_some() {
                candidate.description = update.description;
            }
            check_url(&candidate)?;
            *config = candidate.clone();

            let restart = credentials_changed && reg.live.contains_key(id);
            (candidate, restart)
        };
        self.inner.store.save_gateway(&updated).await?;

        if restart {
            info!(gateway = %id, "Credentials changed, restarting gateway session");
            self.disconnect(id).await?;
            self.connect(id).await?;
        }
        Ok(updated)
    }

    /// Disconnect, delete from the store (cascading), drop from the registry.
    pub async fn remove_gateway(&self, id: &str) -> Result<(), ManagerError> {
        let live = {
            let mut reg = self.inner.registry.write().await;
            if !reg.configs.contains_key(id) {
                return Err(ManagerError::UnknownGateway(id.to_string()));
            }
            reg.live.remove(id)
        };
        if let Some(live) = live {
            live.shutdown().await;
            self.inner
                .record_status(id, GatewayStatus::Disconnected, None)
                .await;
        }
        self.inner.store.delete_gateway(id).await?;
        self.inner.registry.write().await.configs.shift_remove(id);

        info!(gateway = %id, "Gateway removed");
        self.inner.emit(ManagerEvent::GatewayRemoved {
            gateway_id: id.to_string(),
        });
        Ok(())
    }

    /// Start a session for `id`. No-op while the current session is connected
    /// or connecting; a disconnected session is replaced with a fresh one.
    pub async fn connect(&self, id: &str) -> Result<(), ManagerError> {
        let mut reg = self.inner.registry.write().await;
        let config = reg
            .configs
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownGateway(id.to_string()))?;
        check_url(&config)?;

        if let Some(live) = reg.live.get(id) {
            if live.gateway.status() != ConnectionStatus::Disconnected {
                debug!(gateway = %id, "Already connected or connecting");
                return Ok(());
            }
        }
        if let Some(old) = reg.live.remove(id) {
            old.shutdown().await;
        }

        let (gateway, events) = Gateway::new(config.url, config.token, self.inner.options.clone());
        let forwarder = tokio::spawn(forward(Arc::clone(&self.inner), id.to_string(), events));
        gateway.connect().await;
        reg.live.insert(id.to_string(), Live { gateway, forwarder });
        Ok(())
    }

    /// Close the session for `id` on purpose. The config stays registered.
    pub async fn disconnect(&self, id: &str) -> Result<(), ManagerError> {
        let live = {
            let mut reg = self.inner.registry.write().await;
            if !reg.configs.contains_key(id) {
                return Err(ManagerError::UnknownGateway(id.to_string()));
            }
            reg.live.remove(id)
        };
        if let Some(live) = live {
            live.shutdown().await;
            self.inner
                .record_status(id, GatewayStatus::Disconnected, None)
                .await;
        }
        Ok(())
    }

    /// Connect every registered gateway. Failures are recorded as `error`
    /// status plus an [`ManagerEvent::Error`], and returned; they never stop
    /// the batch.
    pub async fn connect_all(&self) -> Vec<(String, ManagerError)> {
        let ids: Vec<String> = self.inner.registry.read().await.configs.keys().cloned().collect();
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.connect(&id).await {
                let message = e.to_string();
                warn!(gateway = %id, error = %message, "Failed to connect gateway");
                self.inner
                    .record_status(&id, GatewayStatus::Error, Some(message.clone()))
                    .await;
                self.inner.emit(ManagerEvent::Error {
                    gateway_id: id.clone(),
                    message,
                });
                failures.push((id, e));
            }
        }
        failures
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.inner.registry.read().await.live.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!(gateway = %id, error = %e, "Failed to disconnect gateway");
            }
        }
    }

    /// Live, connected session for `id`, or the routing error explaining why not.
    pub async fn connected_gateway(&self, id: &str) -> Result<Gateway, ManagerError> {
        let reg = self.inner.registry.read().await;
        if !reg.configs.contains_key(id) {
            return Err(ManagerError::UnknownGateway(id.to_string()));
        }
        match reg.live.get(id) {
            Some(live) if live.gateway.status() == ConnectionStatus::Connected => {
                Ok(live.gateway.clone())
            }
            _ => Err(ManagerError::NotConnected(id.to_string())),
        }
    }

    /// Wait up to `timeout` for the session of `id` to finish its handshake.
    pub async fn wait_connected(&self, id: &str, timeout: Duration) -> Result<Gateway, ManagerError> {
        let gateway = match self.gateway(id).await {
            Some(g) => g,
            None if self.config(id).await.is_some() => {
                return Err(ManagerError::NotConnected(id.to_string()))
            }
            None => return Err(ManagerError::UnknownGateway(id.to_string())),
        };
        if gateway
            .wait_for_status(ConnectionStatus::Connected, timeout)
            .await
        {
            Ok(gateway)
        } else {
            Err(ManagerError::NotConnected(id.to_string()))
        }
    }

    /// Send a chat message. With `gateway_id` the message goes there or
    /// nowhere; without it, to the first connected gateway.
    pub async fn chat_send(
        &self,
        session_key: &str,
        text: &str,
        attachments: &[Attachment],
        gateway_id: Option<&str>,
    ) -> Result<Value, ManagerError> {
        let gateway = match gateway_id {
            Some(id) => self.connected_gateway(id).await?,
            None => {
                let (id, gateway) = self
                    .first_connected()
                    .await
                    .ok_or(ManagerError::NoConnectedGateway)?;
                debug!(gateway = %id, "No gateway given, using first connected");
                gateway
            }
        };
        Ok(gateway.chat_send(session_key, text, attachments).await?)
    }

    /// Sessions of one gateway, or of every connected gateway when `gateway_id`
    /// is `None`. In fan-out mode a failing gateway is logged and skipped.
    pub async fn list_sessions(
        &self,
        gateway_id: Option<&str>,
    ) -> Result<Vec<TaggedSession>, ManagerError> {
        let targets = match gateway_id {
            Some(id) => vec![(id.to_string(), self.connected_gateway(id).await?)],
            None => self.connected().await,
        };
        let explicit = gateway_id.is_some();

        let results = join_all(targets.into_iter().map(|(id, gateway)| async move {
            let result = gateway.list_sessions().await;
            (id, result)
        }))
        .await;

        let mut sessions = Vec::new();
        for (id, result) in results {
            match result {
                Ok(list) => sessions.extend(list.into_iter().map(|session| TaggedSession {
                    gateway_id: id.clone(),
                    session,
                })),
                Err(e) if explicit => return Err(e.into()),
                Err(e) => warn!(gateway = %id, error = %e, "Skipping gateway in sessions.list fan-out"),
            }
        }
        Ok(sessions)
    }

    pub async fn chat_history(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Vec<Value>, ManagerError> {
        let gateway = self.connected_gateway(gateway_id).await?;
        Ok(gateway.chat_history(session_key).await?)
    }

    pub async fn chat_abort(
        &self,
        gateway_id: &str,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<(), ManagerError> {
        let gateway = self.connected_gateway(gateway_id).await?;
        Ok(gateway.chat_abort(session_key, run_id).await?)
    }

    pub async fn delete_session(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<(), ManagerError> {
        let gateway = self.connected_gateway(gateway_id).await?;
        Ok(gateway.delete_session(session_key).await?)
    }

    pub async fn rename_session(
        &self,
        gateway_id: &str,
        session_key: &str,
        name: &str,
    ) -> Result<(), ManagerError> {
        let gateway = self.connected_gateway(gateway_id).await?;
        Ok(gateway.rename_session(session_key, name).await?)
    }

    /// Try a URL/token pair on a throwaway session that is never registered
    /// and emits no manager events. The session is torn down either way.
    pub async fn test_connection(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let (gateway, mut events) = Gateway::new(url, token, self.inner.options.clone());
        gateway.connect().await;

        let outcome = tokio::time::timeout(timeout, async {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Status(ConnectionStatus::Connected) => return Ok(()),
                    GatewayEvent::Status(ConnectionStatus::Disconnected) => {
                        return Err(GatewayError::ConnectionFailed)
                    }
                    _ => {}
                }
            }
            Err(GatewayError::ConnectionFailed)
        })
        .await
        .unwrap_or(Err(GatewayError::Timeout));

        gateway.disconnect().await;
        debug!(url, ok = outcome.is_ok(), "Connection test finished");
        outcome
    }
}

impl Inner {
    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Update the cached config, persist it (best effort), then emit
    /// `statusChange`. Ignored for gateways no longer registered.
    async fn record_status(&self, id: &str, status: GatewayStatus, error: Option<String>) {
        {
            let mut reg = self.registry.write().await;
            let Some(config) = reg.configs.get_mut(id) else {
                return;
            };
            config.apply_status(status, error.as_deref());
        }
        if let Err(e) = self
            .store
            .update_gateway_status(id, status, error.as_deref())
            .await
        {
            warn!(gateway = %id, error = %e, "Failed to persist gateway status");
        }
        self.emit(ManagerEvent::StatusChange {
            gateway_id: id.to_string(),
            status,
        });
    }
}

/// Re-emit one gateway's events tagged with its id.
async fn forward(inner: Arc<Inner>, id: String, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Status(status) => {
                inner.record_status(&id, status.into(), None).await;
            }
            GatewayEvent::Chat {
                event_type,
                payload,
            } => inner.emit(ManagerEvent::ChatEvent {
                gateway_id: id.clone(),
                event_type,
                payload,
            }),
        }
    }
}

fn check_url(config: &GatewayConfig) -> Result<(), ManagerError> {
    if util::is_ws_url(&config.url) {
        Ok(())
    } else {
        Err(ManagerError::InvalidUrl {
            id: config.id.clone(),
            url: config.url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{AgentRecord, ChannelRecord, MemoryStore};
    use crate::test_support::FakeGateway;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn manager_with(store: Arc<dyn ConfigStore>) -> GatewayManager {
        GatewayManager::new(
            store,
            GatewayOptions {
                reconnect_delay: Duration::from_millis(100),
                ..GatewayOptions::default()
            },
        )
    }

    fn manager() -> GatewayManager {
        manager_with(Arc::new(MemoryStore::new()))
    }

    fn echo_sessions(label: &'static str) -> FakeGatewayFn {
        Box::new(move |method, _params| match method {
            "sessions.list" => Ok(json!({ "sessions": [{ "key": label }] })),
            _ => Ok(json!({ "from": label })),
        })
    }

    type FakeGatewayFn = Box<dyn Fn(&str, &Value) -> Result<Value, Value> + Send + Sync>;

    async fn add_connected(mgr: &GatewayManager, id: &str, server: &FakeGateway) {
        mgr.add_gateway(GatewayConfig::new(id, id, &server.url, "tok"), true)
            .await
            .unwrap();
        mgr.wait_connected(id, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_gateway_never_falls_back() {
        let server_a = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let mgr = manager();
        add_connected(&mgr, "a", &server_a).await;
        mgr.add_gateway(GatewayConfig::new("b", "B", "ws://127.0.0.1:9", "tok"), false)
            .await
            .unwrap();

        let err = mgr.chat_send("main", "hi", &[], Some("b")).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotConnected(ref id) if id == "b"));

        let err = mgr.chat_send("main", "hi", &[], Some("zzz")).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownGateway(ref id) if id == "zzz"));

        let err = mgr.chat_history("b", "main").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotConnected(_)));

        assert!(server_a.requests().is_empty());
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn chat_send_without_id_uses_first_connected() {
        let server_a = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let server_b = FakeGateway::spawn_auto(echo_sessions("b")).await;
        let mgr = manager();
        add_connected(&mgr, "a", &server_a).await;
        add_connected(&mgr, "b", &server_b).await;

        let reply = mgr.chat_send("main", "hi", &[], None).await.unwrap();
        assert_eq!(reply, json!({"from": "a"}));
        assert!(server_b.requests().is_empty());

        let reply = mgr.chat_send("main", "hi", &[], Some("b")).await.unwrap();
        assert_eq!(reply, json!({"from": "b"}));
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn no_connected_gateway_is_an_error() {
        let mgr = manager();
        assert!(matches!(
            mgr.chat_send("main", "hi", &[], None).await,
            Err(ManagerError::NoConnectedGateway)
        ));
        assert!(mgr.list_sessions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_connected_follows_registration_order() {
        let server_a = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let server_b = FakeGateway::spawn_auto(echo_sessions("b")).await;
        let mgr = manager();
        mgr.add_gateway(GatewayConfig::new("a", "A", &server_a.url, "tok"), false)
            .await
            .unwrap();
        add_connected(&mgr, "b", &server_b).await;
        mgr.connect("a").await.unwrap();
        mgr.wait_connected("a", WAIT).await.unwrap();

        for _ in 0..5 {
            let (id, _) = mgr.first_connected().await.unwrap();
            assert_eq!(id, "a");
        }
        let ids: Vec<String> = mgr.connected().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(mgr.overall_status().await, ConnectionStatus::Connected);
        mgr.disconnect_all().await;
        assert_eq!(mgr.overall_status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn fan_out_skips_failing_gateway() {
        let healthy_a = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let broken = FakeGateway::spawn_auto(|method: &str, _: &Value| match method {
            "sessions.list" => Err(json!({"message": "boom"})),
            _ => Ok(json!({})),
        })
        .await;
        let healthy_c = FakeGateway::spawn_auto(echo_sessions("c")).await;

        let mgr = manager();
        add_connected(&mgr, "a", &healthy_a).await;
        add_connected(&mgr, "b", &broken).await;
        add_connected(&mgr, "c", &healthy_c).await;

        let sessions = mgr.list_sessions(None).await.unwrap();
        let tags: Vec<(&str, &Value)> = sessions
            .iter()
            .map(|s| (s.gateway_id.as_str(), &s.session["key"]))
            .collect();
        assert_eq!(tags, [("a", &json!("a")), ("c", &json!("c"))]);

        // Explicit id surfaces the failure.
        assert!(matches!(
            mgr.list_sessions(Some("b")).await,
            Err(ManagerError::Gateway(GatewayError::Rejected(_)))
        ));
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn status_changes_are_tagged_cached_and_persisted() {
        let server = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let store = Arc::new(MemoryStore::new());
        let mgr = manager_with(store.clone());
        let mut events = mgr.subscribe();

        mgr.add_gateway(GatewayConfig::new("a", "A", &server.url, "tok"), true)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while !seen.contains(&ManagerEvent::StatusChange {
            gateway_id: "a".into(),
            status: GatewayStatus::Connected,
        }) {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            assert_eq!(event.gateway_id(), "a");
            seen.push(event);
        }
        assert!(matches!(seen[0], ManagerEvent::GatewayAdded { .. }));
        assert!(seen.contains(&ManagerEvent::StatusChange {
            gateway_id: "a".into(),
            status: GatewayStatus::Connecting,
        }));

        let cached = mgr.config("a").await.unwrap();
        assert_eq!(cached.status, GatewayStatus::Connected);
        assert!(cached.last_connected.is_some());
        let stored = store.get_gateway("a").await.unwrap().unwrap();
        assert_eq!(stored.status, GatewayStatus::Connected);
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn chat_events_carry_gateway_id() {
        let mut server = FakeGateway::spawn().await;
        let mgr = manager();
        let mut events = mgr.subscribe();
        mgr.add_gateway(GatewayConfig::new("a", "A", &server.url, "tok"), true)
            .await
            .unwrap();
        let mut conn = server.next_conn().await;
        conn.complete_handshake().await;
        mgr.wait_connected("a", WAIT).await.unwrap();

        conn.send_json(json!({"type": "event", "event": "chat", "payload": {"state": "final"}}))
            .await;
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ManagerEvent::ChatEvent {
                gateway_id,
                event_type,
                payload,
            } = event
            {
                assert_eq!(gateway_id, "a");
                assert_eq!(event_type, "chat");
                assert_eq!(payload, json!({"state": "final"}));
                break;
            }
        }
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn token_change_restarts_connected_session() {
        let mut server = FakeGateway::spawn().await;
        let mgr = manager();
        mgr.add_gateway(GatewayConfig::new("a", "A", &server.url, "old"), true)
            .await
            .unwrap();
        let mut first = server.next_conn().await;
        first.complete_handshake().await;
        mgr.wait_connected("a", WAIT).await.unwrap();

        let updated = mgr
            .update_gateway(
                "a",
                GatewayUpdate {
                    token: Some("new".into()),
                    ..GatewayUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.token, "new");

        // Old socket is closed by the client.
        assert!(first.recv_json().await.is_none());

        let mut second = server.next_conn().await;
        let connect = second.complete_handshake().await;
        assert_eq!(connect["params"]["auth"]["token"], "new");
        mgr.wait_connected("a", WAIT).await.unwrap();
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn name_change_keeps_session() {
        let server = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let mgr = manager();
        add_connected(&mgr, "a", &server).await;

        mgr.update_gateway(
            "a",
            GatewayUpdate {
                name: Some("Renamed".into()),
                ..GatewayUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(mgr.config("a").await.unwrap().name, "Renamed");
        assert_eq!(server.accepted(), 1);
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn remove_gateway_disconnects_and_deletes() {
        let mut server = FakeGateway::spawn().await;
        let store = Arc::new(MemoryStore::new());
        let mgr = manager_with(store.clone());
        mgr.add_gateway(GatewayConfig::new("a", "A", &server.url, "tok"), true)
            .await
            .unwrap();
        let mut conn = server.next_conn().await;
        conn.complete_handshake().await;
        mgr.wait_connected("a", WAIT).await.unwrap();

        let mut events = mgr.subscribe();
        mgr.remove_gateway("a").await.unwrap();

        assert!(conn.recv_json().await.is_none());
        assert!(mgr.config("a").await.is_none());
        assert!(mgr.gateway("a").await.is_none());
        assert!(store.get_gateway("a").await.unwrap().is_none());
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            ManagerEvent::StatusChange {
                gateway_id: "a".into(),
                status: GatewayStatus::Disconnected,
            }
        );
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            ManagerEvent::GatewayRemoved {
                gateway_id: "a".into()
            }
        );
        assert!(matches!(
            mgr.remove_gateway("a").await,
            Err(ManagerError::UnknownGateway(_))
        ));
    }

    #[tokio::test]
    async fn initialize_resets_status_and_caches() {
        let mut persisted = GatewayConfig::new("a", "A", "ws://127.0.0.1:9", "tok");
        persisted.status = GatewayStatus::Connected;
        let store = Arc::new(MemoryStore::with_gateways([persisted]));
        let mgr = manager_with(store.clone());

        let loaded = mgr.initialize().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, GatewayStatus::Disconnected);

        store
            .save_gateway(&GatewayConfig::new("b", "B", "ws://127.0.0.1:9", "tok"))
            .await
            .unwrap();
        assert_eq!(mgr.initialize().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connect_all_records_failures_without_stopping() {
        let server = FakeGateway::spawn_auto(echo_sessions("ok")).await;
        let store = Arc::new(MemoryStore::with_gateways([
            GatewayConfig::new("bad", "Bad", "http://not-a-socket", "tok"),
            GatewayConfig::new("ok", "Ok", &server.url, "tok"),
        ]));
        let mgr = manager_with(store);
        mgr.initialize().await.unwrap();
        let mut events = mgr.subscribe();

        let failures = mgr.connect_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(matches!(failures[0].1, ManagerError::InvalidUrl { .. }));

        mgr.wait_connected("ok", WAIT).await.unwrap();
        let bad = mgr.config("bad").await.unwrap();
        assert_eq!(bad.status, GatewayStatus::Error);
        assert!(bad.error.is_some());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ManagerEvent::Error { ref gateway_id, .. } if gateway_id == "bad") {
                saw_error = true;
            }
        }
        assert!(saw_error);
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn add_gateway_rejects_non_websocket_url() {
        let mgr = manager();
        let err = mgr
            .add_gateway(GatewayConfig::new("x", "X", "http://host", "tok"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidUrl { .. }));
        assert!(mgr.configs().await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_is_never_registered() {
        let server = FakeGateway::spawn_auto(echo_sessions("a")).await;
        let mgr = manager();
        let mut events = mgr.subscribe();

        mgr.test_connection(&server.url, "tok", WAIT).await.unwrap();

        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("ws://{}", listener.local_addr().unwrap())
        };
        assert!(matches!(
            mgr.test_connection(&closed, "tok", WAIT).await,
            Err(GatewayError::ConnectionFailed)
        ));

        assert!(mgr.configs().await.is_empty());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_connection_times_out_without_challenge() {
        let mut server = FakeGateway::spawn().await;
        let mgr = manager();
        let attempt = {
            let mgr = mgr.clone();
            let url = server.url.clone();
            tokio::spawn(async move {
                mgr.test_connection(&url, "tok", Duration::from_millis(200))
                    .await
            })
        };
        let _silent = server.next_conn().await;
        assert!(matches!(
            attempt.await.unwrap(),
            Err(GatewayError::Timeout)
        ));
    }

    #[test]
    fn manager_event_wire_shape() {
        let event = ManagerEvent::ChatEvent {
            gateway_id: "a".into(),
            event_type: "chat".into(),
            payload: json!({"x": 1}),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "chatEvent",
                "gatewayId": "a",
                "payload": {"eventType": "chat", "payload": {"x": 1}}
            })
        );
        let status = ManagerEvent::StatusChange {
            gateway_id: "a".into(),
            status: GatewayStatus::Connecting,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"type": "statusChange", "gatewayId": "a", "payload": {"status": "connecting"}})
        );
        let removed = ManagerEvent::GatewayRemoved {
            gateway_id: "a".into(),
        };
        assert_eq!(
            serde_json::to_value(&removed).unwrap(),
            json!({"type": "gatewayRemoved", "gatewayId": "a", "payload": {}})
        );
        let error = ManagerEvent::Error {
            gateway_id: "a".into(),
            message: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "gatewayId": "a", "payload": {"message": "boom"}})
        );
        let added = ManagerEvent::GatewayAdded {
            gateway_id: "a".into(),
            config: GatewayConfig::new("a", "A", "ws://h", "t"),
        };
        let wire = serde_json::to_value(&added).unwrap();
        assert_eq!(wire["type"], "gatewayAdded");
        assert_eq!(wire["payload"]["id"], "a");
        assert_eq!(wire["payload"]["url"], "ws://h");
    }

    /// Store whose `delete_gateway` always fails.
    struct StuckStore(MemoryStore);

    #[async_trait::async_trait]
    impl ConfigStore for StuckStore {
        async fn load_gateways(&self) -> Result<Vec<GatewayConfig>, StoreError> {
            self.0.load_gateways().await
        }
        async fn get_gateway(&self, id: &str) -> Result<Option<GatewayConfig>, StoreError> {
            self.0.get_gateway(id).await
        }
        async fn save_gateway(&self, config: &GatewayConfig) -> Result<(), StoreError> {
            self.0.save_gateway(config).await
        }
        async fn delete_gateway(&self, _id: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        async fn update_gateway_status(
            &self,
            id: &str,
            status: GatewayStatus,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.0.update_gateway_status(id, status, error).await
        }
        async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
            self.0.save_agent(agent).await
        }
        async fn agents_by_gateway(&self, gateway_id: &str) -> Result<Vec<AgentRecord>, StoreError> {
            self.0.agents_by_gateway(gateway_id).await
        }
        async fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
            self.0.delete_agent(id).await
        }
        async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
            self.0.save_channel(channel).await
        }
        async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
            self.0.channels().await
        }
        async fn delete_channel(&self, id: &str) -> Result<(), StoreError> {
            self.0.delete_channel(id).await
        }
    }

    #[tokio::test]
    async fn failed_store_delete_leaves_gateway_disconnected() {
        let mut server = FakeGateway::spawn().await;
        let store = Arc::new(StuckStore(MemoryStore::new()));
        let mgr = manager_with(store.clone());
        mgr.add_gateway(GatewayConfig::new("a", "A", &server.url, "tok"), true)
            .await
            .unwrap();
        let mut conn = server.next_conn().await;
        conn.complete_handshake().await;
        mgr.wait_connected("a", WAIT).await.unwrap();

        assert!(matches!(
            mgr.remove_gateway("a").await,
            Err(ManagerError::Store(_))
        ));
        assert!(conn.recv_json().await.is_none());
        assert!(mgr.gateway("a").await.is_none());
        let config = mgr.config("a").await.unwrap();
        assert_eq!(config.status, GatewayStatus::Disconnected);
        let persisted = store.get_gateway("a").await.unwrap().unwrap();
        assert_eq!(persisted.status, GatewayStatus::Disconnected);
        assert_eq!(mgr.overall_status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_how_many_events_it_lost() {
        let mgr = manager();
        let mut slow = mgr.subscribe();
        let mut fast = mgr.subscribe();
        for i in 0..EVENT_CAPACITY + 4 {
            mgr.inner.emit(ManagerEvent::GatewayRemoved {
                gateway_id: format!("g{i}"),
            });
            assert!(fast.try_recv().is_ok());
        }
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(4))
        ));
        assert_eq!(
            slow.try_recv().unwrap(),
            ManagerEvent::GatewayRemoved {
                gateway_id: "g4".into()
            }
        );
    }
}
