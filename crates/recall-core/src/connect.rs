//! Backing-store connection for the binaries.

use std::sync::Arc;

use async_trait::async_trait;
use recall_state::{
    AgentState, AgentStateKey, CoordinationEvent, EventFilter, MemoryRecord, MemorySearch,
    RemoteStore, StorageError, StorageResult, SurrealHandle, SystemState,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::RemoteSection;

/// A [`RemoteStore`] that connects on first use and keeps retrying.
///
/// While no connection can be made every call fails with `Unavailable`, so
/// the memory store and coordination manager degrade as for any outage and
/// pick the connection up on a later probe.
pub struct ReconnectingRemote {
    config: RemoteSection,
    handle: OnceCell<SurrealHandle>,
}

impl ReconnectingRemote {
    pub fn new(config: RemoteSection) -> Self {
        Self {
            config,
            handle: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.initialized()
    }

    /// Connect now if not yet connected.
    pub async fn connect(&self) -> StorageResult<()> {
        self.handle().await.map(|_| ())
    }

    async fn handle(&self) -> StorageResult<&SurrealHandle> {
        self.handle
            .get_or_try_init(|| async {
                let handle = open(&self.config).await?;
                info!("Backing store connected");
                Ok::<_, StorageError>(handle)
            })
            .await
    }
}

/// One bounded connection attempt.
///
/// An explicit `endpoint` wins; otherwise the `SURREALDB_*` environment is
/// consulted and the local directory is the fallback.
async fn open(config: &RemoteSection) -> StorageResult<SurrealHandle> {
    let connecting = async {
        match config.endpoint.as_deref() {
            Some(endpoint) => SurrealHandle::setup_url(endpoint).await,
            None => SurrealHandle::setup_from_env(&config.local_path).await,
        }
    };
    match tokio::time::timeout(config.connect_timeout(), connecting).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(err)) => {
            debug!(error = %err, "Connection attempt failed");
            Err(StorageError::Unavailable(err.to_string()))
        }
        Err(_) => Err(StorageError::Unavailable(format!(
            "connect timed out after {}ms",
            config.connect_timeout_ms
        ))),
    }
}

/// Connect to the configured backing store.
///
/// Never fails: an unreachable store is logged and the returned remote
/// keeps trying to connect whenever it is used.
pub async fn connect_remote(config: &RemoteSection) -> Arc<ReconnectingRemote> {
    let remote = Arc::new(ReconnectingRemote::new(config.clone()));
    if let Err(err) = remote.connect().await {
        warn!(error = %err, "Backing store unreachable; starting degraded and retrying");
    }
    remote
}

#[async_trait]
impl RemoteStore for ReconnectingRemote {
    async fn ping(&self) -> StorageResult<()> {
        self.handle().await?.ping().await
    }

    async fn put_memory(&self, record: &MemoryRecord) -> StorageResult<()> {
        self.handle().await?.put_memory(record).await
    }

    async fn get_memory(&self, id: &str) -> StorageResult<Option<MemoryRecord>> {
        self.handle().await?.get_memory(id).await
    }

    async fn delete_memory(&self, id: &str) -> StorageResult<()> {
        self.handle().await?.delete_memory(id).await
    }

    async fn search_memories(&self, search: &MemorySearch) -> StorageResult<Vec<MemoryRecord>> {
        self.handle().await?.search_memories(search).await
    }

    async fn count_memories(&self) -> StorageResult<u64> {
        self.handle().await?.count_memories().await
    }

    async fn put_agent_state(&self, state: &AgentState) -> StorageResult<()> {
        self.handle().await?.put_agent_state(state).await
    }

    async fn get_agent_state(&self, key: &AgentStateKey) -> StorageResult<Option<AgentState>> {
        self.handle().await?.get_agent_state(key).await
    }

    async fn find_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> StorageResult<Option<AgentState>> {
        self.handle()
            .await?
            .find_agent_state(agent_id, session_id)
            .await
    }

    async fn list_agent_states(&self, agent_id: Option<&str>) -> StorageResult<Vec<AgentState>> {
        self.handle().await?.list_agent_states(agent_id).await
    }

    async fn append_event(&self, event: &CoordinationEvent) -> StorageResult<()> {
        self.handle().await?.append_event(event).await
    }

    async fn list_events(&self, filter: &EventFilter) -> StorageResult<Vec<CoordinationEvent>> {
        self.handle().await?.list_events(filter).await
    }

    async fn get_system_state(&self) -> StorageResult<Option<SystemState>> {
        self.handle().await?.get_system_state().await
    }

    async fn put_system_state(&self, state: &SystemState) -> StorageResult<()> {
        self.handle().await?.put_system_state(state).await
    }
}

impl std::fmt::Debug for ReconnectingRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingRemote")
            .field("endpoint", &self.config.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStoreConfig, TieredMemoryStore};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn section(endpoint: &str) -> RemoteSection {
        RemoteSection {
            endpoint: Some(endpoint.into()),
            connect_timeout_ms: 2_000,
            ..RemoteSection::default()
        }
    }

    #[tokio::test]
    async fn test_connects_in_memory_endpoint() {
        let remote = connect_remote(&section("mem://")).await;
        assert!(remote.is_connected());
        remote.ping().await.unwrap();
        assert_eq!(remote.count_memories().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reads_as_unavailable() {
        let remote = connect_remote(&section("bogus-scheme://nowhere")).await;
        assert!(!remote.is_connected());

        let err = remote.ping().await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");
        assert!(remote.get_memory("m1").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_store_recovers_once_remote_becomes_reachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        let remote = connect_remote(&RemoteSection {
            local_path: blocker.join("db"),
            ..RemoteSection::default()
        })
        .await;
        assert!(!remote.is_connected());

        let store = TieredMemoryStore::open(
            remote.clone(),
            MemoryStoreConfig {
                probe_interval: Duration::ZERO,
                ..MemoryStoreConfig::default()
            },
        )
        .await;
        assert!(store.is_degraded());
        store.write("Task: keep this", BTreeSet::new()).unwrap();
        let report = store.sync().await;
        assert_eq!(report.failed_count, 1);
        assert_eq!(store.stats().cache.dirty, 1);

        std::fs::remove_file(&blocker).unwrap();
        let report = store.sync().await;
        assert_eq!(report.synced_count, 1);
        assert!(remote.is_connected());
        assert!(!store.is_degraded());
        assert_eq!(remote.count_memories().await.unwrap(), 1);
    }
}
