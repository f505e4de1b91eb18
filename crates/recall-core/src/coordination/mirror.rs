//! In-memory mirror of coordination state.
//!
//! Every write lands here first. Entries not yet confirmed by the backing
//! store are dirty and are pushed by reconciliation; clean entries are a
//! read-through copy used while the store is unreachable.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use recall_state::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventFilter, SystemState,
};
use serde::{Deserialize, Serialize};

/// Clean events kept for degraded reads; dirty events are never dropped.
const MAX_CLEAN_EVENTS: usize = 5_000;
/// Clean agent states kept for degraded reads, least recently updated dropped first.
const MAX_CLEAN_AGENTS: usize = 5_000;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    dirty: bool,
}

#[derive(Debug, Clone)]
struct AgentEntry {
    value: AgentState,
    dirty: bool,
    /// Status the write assumed the backing store held, when the store
    /// could not be asked at write time.
    assumed_from: Option<AgentStatus>,
}

/// An agent state waiting to be pushed.
#[derive(Debug, Clone)]
pub struct PendingAgent {
    pub state: AgentState,
    /// Set for writes checked without the stored predecessor.
    pub assumed_from: Option<AgentStatus>,
}

#[derive(Debug, Default)]
struct Inner {
    agents: HashMap<AgentStateKey, AgentEntry>,
    /// Keyed by event document key, so iteration is chronological.
    events: BTreeMap<String, Entry<CoordinationEvent>>,
    system: Option<Entry<SystemState>>,
}

/// Counts of mirrored and unpersisted entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStats {
    pub agent_states: usize,
    pub events: usize,
    pub dirty_agent_states: usize,
    pub dirty_events: usize,
    pub system_state_dirty: bool,
}

impl MirrorStats {
    pub fn pending(&self) -> usize {
        self.dirty_agent_states + self.dirty_events + usize::from(self.system_state_dirty)
    }
}

#[derive(Debug, Default)]
pub struct StateMirror {
    inner: Mutex<Inner>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- agent states -------------------------------------------------------

    /// Store a local write, pending persistence.
    pub fn put_agent(&self, state: AgentState) {
        self.insert_agent(state, true, None);
    }

    /// Store a local write whose predecessor could not be read from the
    /// backing store. Reconciliation re-checks it against the stored record.
    pub fn put_agent_provisional(&self, state: AgentState, assumed_from: AgentStatus) {
        self.insert_agent(state, true, Some(assumed_from));
    }

    fn insert_agent(&self, state: AgentState, dirty: bool, assumed_from: Option<AgentStatus>) {
        let mut inner = self.lock();
        inner.agents.insert(
            state.key(),
            AgentEntry {
                value: state,
                dirty,
                assumed_from,
            },
        );
        if !dirty {
            trim_clean_agents(&mut inner.agents);
        }
    }

    /// Store a copy read from the backing store. A dirty entry at least as
    /// new is kept.
    pub fn put_agent_clean(&self, state: AgentState) {
        if let Some(existing) = self.lock().agents.get(&state.key()) {
            if existing.dirty && existing.value.last_updated >= state.last_updated {
                return;
            }
        }
        self.insert_agent(state, false, None);
    }

    /// The assumed predecessor status of a provisional write, if `key` holds one.
    pub fn assumed_from(&self, key: &AgentStateKey) -> Option<AgentStatus> {
        self.lock()
            .agents
            .get(key)
            .filter(|e| e.dirty)
            .and_then(|e| e.assumed_from)
    }

    pub fn is_agent_dirty(&self, key: &AgentStateKey) -> bool {
        self.lock().agents.get(key).is_some_and(|e| e.dirty)
    }

    /// Drop a pending write unless it was rewritten after `written_at`.
    pub fn discard_agent(&self, key: &AgentStateKey, written_at: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner
            .agents
            .get(key)
            .is_some_and(|e| e.value.last_updated == written_at)
        {
            inner.agents.remove(key);
        }
    }

    pub fn get_agent(&self, key: &AgentStateKey) -> Option<AgentState> {
        self.lock().agents.get(key).map(|e| e.value.clone())
    }

    /// Most recently updated record for the agent and session, any type.
    pub fn find_agent(&self, agent_id: &str, session_id: &str) -> Option<AgentState> {
        self.lock()
            .agents
            .values()
            .filter(|e| e.value.agent_id == agent_id && e.value.session_id == session_id)
            .max_by_key(|e| e.value.last_updated)
            .map(|e| e.value.clone())
    }

    pub fn list_agents(&self, agent_id: Option<&str>) -> Vec<AgentState> {
        self.lock()
            .agents
            .values()
            .filter(|e| agent_id.map_or(true, |id| e.value.agent_id == id))
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn dirty_agents(&self) -> Vec<PendingAgent> {
        self.lock()
            .agents
            .values()
            .filter(|e| e.dirty)
            .map(|e| PendingAgent {
                state: e.value.clone(),
                assumed_from: e.assumed_from,
            })
            .collect()
    }

    /// Clear the dirty flag unless the entry was rewritten after `written_at`.
    pub fn mark_agent_persisted(&self, key: &AgentStateKey, written_at: DateTime<Utc>) {
        if let Some(entry) = self.lock().agents.get_mut(key) {
            if entry.value.last_updated == written_at {
                entry.dirty = false;
                entry.assumed_from = None;
            }
        }
    }

    // -- events -------------------------------------------------------------

    pub fn put_event(&self, event: CoordinationEvent, dirty: bool) {
        let mut inner = self.lock();
        let key = event.document_key();
        let dirty = dirty || inner.events.get(&key).is_some_and(|e| e.dirty);
        inner.events.insert(key, Entry { value: event, dirty });
        trim_clean_events(&mut inner.events);
    }

    /// Matching events, newest first.
    pub fn list_events(&self, filter: &EventFilter) -> Vec<CoordinationEvent> {
        let inner = self.lock();
        let matching = inner
            .events
            .values()
            .rev()
            .filter(|e| filter.matches(&e.value))
            .map(|e| e.value.clone());
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn dirty_events(&self) -> Vec<CoordinationEvent> {
        self.lock()
            .events
            .values()
            .filter(|e| e.dirty)
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn mark_event_persisted(&self, document_key: &str) {
        if let Some(entry) = self.lock().events.get_mut(document_key) {
            entry.dirty = false;
        }
    }

    // -- system state -------------------------------------------------------

    pub fn system(&self) -> Option<SystemState> {
        self.lock().system.as_ref().map(|e| e.value.clone())
    }

    pub fn put_system(&self, state: SystemState) {
        self.lock().system = Some(Entry {
            value: state,
            dirty: true,
        });
    }

    pub fn put_system_clean(&self, state: SystemState) {
        let mut inner = self.lock();
        if let Some(existing) = &inner.system {
            if existing.dirty && existing.value.last_updated >= state.last_updated {
                return;
            }
        }
        inner.system = Some(Entry {
            value: state,
            dirty: false,
        });
    }

    pub fn dirty_system(&self) -> Option<SystemState> {
        self.lock()
            .system
            .as_ref()
            .filter(|e| e.dirty)
            .map(|e| e.value.clone())
    }

    pub fn mark_system_persisted(&self, written_at: DateTime<Utc>) {
        if let Some(entry) = self.lock().system.as_mut() {
            if entry.value.last_updated == written_at {
                entry.dirty = false;
            }
        }
    }

    pub fn stats(&self) -> MirrorStats {
        let inner = self.lock();
        MirrorStats {
            agent_states: inner.agents.len(),
            events: inner.events.len(),
            dirty_agent_states: inner.agents.values().filter(|e| e.dirty).count(),
            dirty_events: inner.events.values().filter(|e| e.dirty).count(),
            system_state_dirty: inner.system.as_ref().is_some_and(|e| e.dirty),
        }
    }
}

fn trim_clean_agents(agents: &mut HashMap<AgentStateKey, AgentEntry>) {
    let clean = agents.values().filter(|e| !e.dirty).count();
    if clean <= MAX_CLEAN_AGENTS {
        return;
    }
    let mut oldest: Vec<(DateTime<Utc>, AgentStateKey)> = agents
        .iter()
        .filter(|(_, e)| !e.dirty)
        .map(|(k, e)| (e.value.last_updated, k.clone()))
        .collect();
    oldest.sort();
    for (_, key) in oldest.into_iter().take(clean - MAX_CLEAN_AGENTS) {
        agents.remove(&key);
    }
}

fn trim_clean_events(events: &mut BTreeMap<String, Entry<CoordinationEvent>>) {
    let clean = events.values().filter(|e| !e.dirty).count();
    if clean <= MAX_CLEAN_EVENTS {
        return;
    }
    let excess: Vec<String> = events
        .iter()
        .filter(|(_, e)| !e.dirty)
        .take(clean - MAX_CLEAN_EVENTS)
        .map(|(k, _)| k.clone())
        .collect();
    for key in excess {
        events.remove(&key);
    }
}
