//! JSON-file [`ConfigStore`].
//!
//! The whole document is held in memory and rewritten on every mutation:
//! serialize → write `<path>.tmp` → rename over `<path>`. A crash mid-write
//! leaves the previous document intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AgentRecord, ChannelRecord, ConfigStore, GatewayConfig, GatewayStatus, StoreData};
use crate::error::StoreError;

pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. A missing file is an empty
    /// store; it is created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StoreData::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), gateways = data.gateways.len(), "Opened gateway store");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the document, persist the copy, and only then
    /// replace the in-memory document. The lock is held throughout so
    /// concurrent writers cannot interleave renames.
    async fn mutate(&self, f: impl FnOnce(&mut StoreData)) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        f(&mut next);
        write_atomic(&self.path, &next).await?;
        *data = next;
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(data)?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp_path = PathBuf::from(temp);

    tokio::fs::write(&temp_path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn load_gateways(&self) -> Result<Vec<GatewayConfig>, StoreError> {
        Ok(self.data.lock().await.gateways.clone())
    }

    async fn get_gateway(&self, id: &str) -> Result<Option<GatewayConfig>, StoreError> {
        let data = self.data.lock().await;
        Ok(data.gateways.iter().find(|g| g.id == id).cloned())
    }

    async fn save_gateway(&self, config: &GatewayConfig) -> Result<(), StoreError> {
        self.mutate(|d| d.upsert_gateway(config)).await
    }

    async fn delete_gateway(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|d| d.remove_gateway(id)).await
    }

    async fn update_gateway_status(
        &self,
        id: &str,
        status: GatewayStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        if next.set_status(id, status, error) {
            write_atomic(&self.path, &next).await?;
            *data = next;
        }
        Ok(())
    }

    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.mutate(|d| d.upsert_agent(agent)).await
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
        self.mutate(|d| d.agents.retain(|a| a.id != id)).await
    }

    async fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        self.mutate(|d| d.upsert_channel(channel)).await
    }

    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        Ok(self.data.lock().await.channels.clone())
    }

    async fn delete_channel(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|d| d.channels.retain(|c| c.id != id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("gateways.json")).await.unwrap();
        assert!(store.load_gateways().await.unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateways.json");

        let store = FileStore::open(&path).await.unwrap();
        store
            .save_gateway(&GatewayConfig::new("a", "Alpha", "ws://localhost:18789", "tok"))
            .await
            .unwrap();
        store
            .update_gateway_status("a", GatewayStatus::Connected, None)
            .await
            .unwrap();
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        let gw = reopened.get_gateway("a").await.unwrap().unwrap();
        assert_eq!(gw.name, "Alpha");
        assert_eq!(gw.status, GatewayStatus::Connected);
        assert!(gw.last_connected.is_some());

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_and_disk_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateways.json");
        let store = FileStore::open(&path).await.unwrap();
        store
            .save_gateway(&GatewayConfig::new("a", "Alpha", "ws://localhost:18789", "tok"))
            .await
            .unwrap();

        // A directory where the temp file should go makes every write fail.
        std::fs::create_dir(dir.path().join("gateways.json.tmp")).unwrap();

        assert!(store
            .save_gateway(&GatewayConfig::new("b", "Beta", "ws://localhost:18790", "tok"))
            .await
            .is_err());
        assert!(store.delete_gateway("a").await.is_err());
        assert!(store
            .update_gateway_status("a", GatewayStatus::Connected, None)
            .await
            .is_err());

        let cached = store.load_gateways().await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "a");
        assert_eq!(cached[0].status, GatewayStatus::Disconnected);

        drop(store);
        let reopened = FileStore::open(&path).await.unwrap();
        let on_disk = reopened.load_gateways().await.unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].status, GatewayStatus::Disconnected);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateways.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Json(_))
        ));
    }
}
