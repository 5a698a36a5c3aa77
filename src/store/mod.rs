//! Persistent records and the [`ConfigStore`] abstraction.
//!
//! The manager only needs a keyed object store: CRUD for [`GatewayConfig`],
//! plus agent and channel records that may be scoped to a gateway. Deleting a
//! gateway cascades to the agents that belong to it and the channels scoped
//! to it.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: process lifetime only, used by tests and `--ephemeral`.
//! - [`FileStore`]: one JSON document on disk, rewritten atomically.

mod file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::gateway::ConnectionStatus;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Cached connection status stored alongside a gateway config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl GatewayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl From<ConnectionStatus> for GatewayStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Disconnected => Self::Disconnected,
            ConnectionStatus::Connecting => Self::Connecting,
            ConnectionStatus::Connected => Self::Connected,
        }
    }
}

/// A configured remote gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Opaque, unique, stable across reconnects.
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
    /// Cached; the live gateway is authoritative while it runs.
    #[serde(default)]
    pub status: GatewayStatus,
    /// Unix milliseconds.
    #[serde(default)]
    pub added_at: u64,
    /// Unix milliseconds of the last successful handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl GatewayConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            token: token.into(),
            status: GatewayStatus::Disconnected,
            added_at: crate::util::now_ms(),
            last_connected: None,
            error: None,
            role: None,
            avatar: None,
            description: None,
        }
    }

    /// Apply a status transition to the cached fields.
    pub fn apply_status(&mut self, status: GatewayStatus, error: Option<&str>) {
        self.status = status;
        self.error = error.map(ToString::to_string);
        if status == GatewayStatus::Connected {
            self.last_connected = Some(crate::util::now_ms());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
    Busy,
}

/// An agent hosted by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub gateway_id: String,
    pub name: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

/// A channel grouping agents, optionally scoped to a single gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub member_agent_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

/// Keyed object store consumed by [`crate::GatewayManager`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All gateway configs, in the order they were first saved.
    async fn load_gateways(&self) -> Result<Vec<GatewayConfig>, StoreError>;
    async fn get_gateway(&self, id: &str) -> Result<Option<GatewayConfig>, StoreError>;
    /// Insert or replace by id.
    async fn save_gateway(&self, config: &GatewayConfig) -> Result<(), StoreError>;
    /// Delete a gateway and every agent/channel scoped to it.
    async fn delete_gateway(&self, id: &str) -> Result<(), StoreError>;
    /// Update the cached status fields. Unknown ids are ignored.
    async fn update_gateway_status(
        &self,
        id: &str,
        status: GatewayStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StoreError>;
    async fn agents_by_gateway(&self, gateway_id: &str) -> Result<Vec<AgentRecord>, StoreError>;
    async fn delete_agent(&self, id: &str) -> Result<(), StoreError>;

    async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError>;
    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError>;
    async fn delete_channel(&self, id: &str) -> Result<(), StoreError>;
}

/// The whole persisted document. Shared by both store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    gateways: Vec<GatewayConfig>,
    #[serde(default)]
    agents: Vec<AgentRecord>,
    #[serde(default)]
    channels: Vec<ChannelRecord>,
}

impl StoreData {
    fn upsert_gateway(&mut self, config: &GatewayConfig) {
        match self.gateways.iter_mut().find(|g| g.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => self.gateways.push(config.clone()),
        }
    }

    fn remove_gateway(&mut self, id: &str) {
        self.gateways.retain(|g| g.id != id);
        self.agents.retain(|a| a.gateway_id != id);
        self.channels
            .retain(|c| c.gateway_id.as_deref() != Some(id));
    }

    fn set_status(&mut self, id: &str, status: GatewayStatus, error: Option<&str>) -> bool {
        match self.gateways.iter_mut().find(|g| g.id == id) {
            Some(g) => {
                g.apply_status(status, error);
                true
            }
            None => false,
        }
    }

    fn upsert_agent(&mut self, agent: &AgentRecord) {
        match self.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent.clone(),
            None => self.agents.push(agent.clone()),
        }
    }

    fn upsert_channel(&mut self, channel: &ChannelRecord) {
        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel.clone(),
            None => self.channels.push(channel.clone()),
        }
    }
}
