//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryRemoteStore` satisfies the [`RemoteStore`] contract without any
//! external dependencies and exposes switches to simulate outages, slow
//! responses, flaky writes and malformed-record rejections.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{AgentState, AgentStateKey, CoordinationEvent, MemoryRecord, SystemState};
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    memories: HashMap<String, MemoryRecord>,
    agent_states: HashMap<String, AgentState>,
    events: BTreeMap<String, CoordinationEvent>,
    system: Option<SystemState>,
}

/// In-memory remote store backed by `HashMap`s.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    flaky_calls: AtomicU32,
    rejected_ids: Mutex<HashSet<String>>,
    memory_puts: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `calls` operations with a transient backend error.
    pub fn fail_next(&self, calls: u32) {
        self.flaky_calls.store(calls, Ordering::SeqCst);
    }

    /// Permanently reject writes of the memory with this id.
    pub fn reject_memory(&self, id: impl Into<String>) {
        self.rejected_ids.lock().unwrap().insert(id.into());
    }

    /// Number of accepted `put_memory` calls.
    pub fn memory_puts(&self) -> u64 {
        self.memory_puts.load(Ordering::SeqCst)
    }

    pub fn memory_count(&self) -> usize {
        self.tables.lock().unwrap().memories.len()
    }

    pub fn event_count(&self) -> usize {
        self.tables.lock().unwrap().events.len()
    }

    pub fn agent_state_count(&self) -> usize {
        self.tables.lock().unwrap().agent_states.len()
    }

    /// Overwrite a stored memory directly, bypassing the gate.
    pub fn seed_memory(&self, record: MemoryRecord) {
        self.tables
            .lock()
            .unwrap()
            .memories
            .insert(record.id.clone(), record);
    }

    /// Overwrite a stored agent state directly, bypassing the gate.
    pub fn seed_agent_state(&self, state: AgentState) {
        self.tables
            .lock()
            .unwrap()
            .agent_states
            .insert(state.key().document_key(), state);
    }

    async fn gate(&self) -> StorageResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        let flaky = self
            .flaky_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if flaky.is_ok() {
            return Err(StorageError::Backend("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn ping(&self) -> StorageResult<()> {
        self.gate().await
    }

    async fn put_memory(&self, record: &MemoryRecord) -> StorageResult<()> {
        self.gate().await?;
        if self.rejected_ids.lock().unwrap().contains(&record.id) {
            return Err(StorageError::Validation(format!(
                "memory {} rejected by store",
                record.id
            )));
        }
        record.validate()?;
        self.tables
            .lock()
            .unwrap()
            .memories
            .insert(record.id.clone(), record.clone());
        self.memory_puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> StorageResult<Option<MemoryRecord>> {
        self.gate().await?;
        Ok(self.tables.lock().unwrap().memories.get(id).cloned())
    }

    async fn delete_memory(&self, id: &str) -> StorageResult<()> {
        self.gate().await?;
        self.tables.lock().unwrap().memories.remove(id);
        Ok(())
    }

    async fn search_memories(&self, search: &MemorySearch) -> StorageResult<Vec<MemoryRecord>> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap();
        let mut hits: Vec<MemoryRecord> = tables
            .memories
            .values()
            .filter(|r| search.matches(r))
            .cloned()
            .collect();
        search.rank(&mut hits);
        Ok(hits)
    }

    async fn count_memories(&self) -> StorageResult<u64> {
        self.gate().await?;
        Ok(self.tables.lock().unwrap().memories.len() as u64)
    }

    async fn put_agent_state(&self, state: &AgentState) -> StorageResult<()> {
        self.gate().await?;
        state.validate()?;
        self.tables
            .lock()
            .unwrap()
            .agent_states
            .insert(state.key().document_key(), state.clone());
        Ok(())
    }

    async fn get_agent_state(&self, key: &AgentStateKey) -> StorageResult<Option<AgentState>> {
        self.gate().await?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .agent_states
            .get(&key.document_key())
            .cloned())
    }

    async fn find_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> StorageResult<Option<AgentState>> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .agent_states
            .values()
            .filter(|s| s.agent_id == agent_id && s.session_id == session_id)
            .max_by_key(|s| s.last_updated)
            .cloned())
    }

    async fn list_agent_states(&self, agent_id: Option<&str>) -> StorageResult<Vec<AgentState>> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap();
        let mut states: Vec<AgentState> = tables
            .agent_states
            .values()
            .filter(|s| agent_id.map(|id| s.agent_id == id).unwrap_or(true))
            .cloned()
            .collect();
        states.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(states)
    }

    async fn append_event(&self, event: &CoordinationEvent) -> StorageResult<()> {
        self.gate().await?;
        event.validate()?;
        self.tables
            .lock()
            .unwrap()
            .events
            .insert(event.document_key(), event.clone());
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> StorageResult<Vec<CoordinationEvent>> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap();
        // Keys sort chronologically, so reverse iteration is newest first.
        let events = tables
            .events
            .values()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(events)
    }

    async fn get_system_state(&self) -> StorageResult<Option<SystemState>> {
        self.gate().await?;
        Ok(self.tables.lock().unwrap().system.clone())
    }

    async fn put_system_state(&self, state: &SystemState) -> StorageResult<()> {
        self.gate().await?;
        self.tables.lock().unwrap().system = Some(state.clone());
        Ok(())
    }
}
