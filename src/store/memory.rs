//! In-memory [`ConfigStore`].

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AgentRecord, ChannelRecord, ConfigStore, GatewayConfig, GatewayStatus, StoreData};
use crate::error::StoreError;

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with gateway configs (in order).
    pub fn with_gateways(gateways: impl IntoIterator<Item = GatewayConfig>) -> Self {
        let mut data = StoreData::default();
        for g in gateways {
            data.upsert_gateway(&g);
        }
        Self {
            data: Mutex::new(data),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_gateways(&self) -> Result<Vec<GatewayConfig>, StoreError> {
        Ok(self.data.lock().await.gateways.clone())
    }

    async fn get_gateway(&self, id: &str) -> Result<Option<GatewayConfig>, StoreError> {
        let data = self.data.lock().await;
        Ok(data.gateways.iter().find(|g| g.id == id).cloned())
    }

    async fn save_gateway(&self, config: &GatewayConfig) -> Result<(), StoreError> {
        self.data.lock().await.upsert_gateway(config);
        Ok(())
    }

    async fn delete_gateway(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().await.remove_gateway(id);
        Ok(())
    }

    async fn update_gateway_status(
        &self,
        id: &str,
        status: GatewayStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.data.lock().await.set_status(id, status, error);
        Ok(())
    }

    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.data.lock().await.upsert_agent(agent);
        Ok(())
    }

    async fn agents_by_gateway(&self, gateway_id: &str) -> Result<Vec<AgentRecord>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .agents
            .iter()
            .filter(|a| a.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().await.agents.retain(|a| a.id != id);
        Ok(())
    }

    async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        self.data.lock().await.upsert_channel(channel);
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        Ok(self.data.lock().await.channels.clone())
    }

    async fn delete_channel(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().await.channels.retain(|c| c.id != id);
        Ok(())
    }
}
