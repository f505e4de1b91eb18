//! Coordination State Manager: agent operational records, the coordination
//! event log and the deployment-wide system state.
//!
//! Every write lands in a [`StateMirror`] first and is then pushed to the
//! backing store. When the store is unreachable the write still succeeds
//! and is reported with `persisted: false`; [`CoordinationStateManager::reconcile`]
//! pushes what is pending once the store answers again, keeping whichever
//! copy of a record was updated last.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recall_state::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventFilter, EventType,
    RemoteStore, StorageError, StorageResult, SystemState, SystemStateDelta,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use super::error::{CoordinationError, CoordinationResult};
use super::mirror::{MirrorStats, PendingAgent, StateMirror};
use crate::obs;
use crate::retry::{call_with_retry, with_timeout, RetryPolicy};
use crate::status::{BackendStatus, StatusMonitor};

const COMPONENT: &str = "coordination";
const SKIPPED: &str = "backing store unavailable";
const NO_REMOTE: &str = "no backing store configured";

/// Tunables for [`CoordinationStateManager`].
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Version recorded when the system state is first created.
    pub system_version: String,
    /// Emergency-stop value used when the system state is first created.
    pub emergency_stop: bool,
    pub remote_timeout: Duration,
    pub probe_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            system_version: env!("CARGO_PKG_VERSION").to_string(),
            emergency_stop: false,
            remote_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

/// A stored value and whether the backing store confirmed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome<T> {
    pub value: T,
    /// `false` when the value is held only in the in-memory mirror.
    pub persisted: bool,
}

/// Result of [`CoordinationStateManager::record_coordination_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Recorded {
        event: CoordinationEvent,
        persisted: bool,
    },
    /// A SPAWN refused by the emergency stop; the FAILURE event was logged instead.
    Rejected {
        failure_event: CoordinationEvent,
        persisted: bool,
    },
}

impl EventOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, EventOutcome::Rejected { .. })
    }

    /// The event that was written to the log.
    pub fn event(&self) -> &CoordinationEvent {
        match self {
            EventOutcome::Recorded { event, .. } => event,
            EventOutcome::Rejected { failure_event, .. } => failure_event,
        }
    }

    pub fn persisted(&self) -> bool {
        match self {
            EventOutcome::Recorded { persisted, .. } | EventOutcome::Rejected { persisted, .. } => {
                *persisted
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeSummary {
    pub count: usize,
    pub succeeded: usize,
}

/// Per-type counts and overall success rate of a set of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSummary {
    pub total_events: usize,
    pub succeeded: usize,
    /// `succeeded / total_events`, or 0 when there are no events.
    pub success_rate: f64,
    pub by_type: BTreeMap<EventType, EventTypeSummary>,
}

impl CoordinationSummary {
    pub fn from_events(events: &[CoordinationEvent]) -> Self {
        let mut summary = CoordinationSummary::default();
        for event in events {
            let entry = summary.by_type.entry(event.event_type).or_default();
            entry.count += 1;
            summary.total_events += 1;
            if event.success {
                entry.succeeded += 1;
                summary.succeeded += 1;
            }
        }
        if summary.total_events > 0 {
            summary.success_rate = summary.succeeded as f64 / summary.total_events as f64;
        }
        summary
    }
}

/// One mirror entry reconciliation could not push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub agent_states_pushed: usize,
    pub events_pushed: usize,
    pub system_state_pushed: bool,
    /// Entries where the backing store already held a newer copy, which was kept.
    pub remote_newer: usize,
    pub failed: usize,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    fn fail(&mut self, key: impl Into<String>, reason: impl Into<String>) {
        self.failed += 1;
        self.failures.push(ReconcileFailure {
            key: key.into(),
            reason: reason.into(),
        });
    }
}

/// What a save is checked against.
struct Predecessor {
    state: Option<AgentState>,
    /// Set when the stored record could not be read: the status the check
    /// assumed the backing store holds.
    assumed_from: Option<AgentStatus>,
}

/// Agent states, coordination events and system state over a [`RemoteStore`].
pub struct CoordinationStateManager {
    remote: Option<Arc<dyn RemoteStore>>,
    mirror: StateMirror,
    monitor: StatusMonitor,
    config: CoordinationConfig,
    /// Serializes read-check-write of agent states.
    agent_lock: Mutex<()>,
    /// Serializes read-modify-write of the system state.
    system_lock: Mutex<()>,
    reconcile_lock: Mutex<()>,
}

impl CoordinationStateManager {
    /// Open a manager over `remote`, probing it once. An unreachable store
    /// starts the manager in degraded mode.
    pub async fn open(remote: Arc<dyn RemoteStore>, config: CoordinationConfig) -> Self {
        let manager = Self::build(Some(remote), config, BackendStatus::Connected);
        manager.check_remote().await;
        manager
    }

    /// A manager backed only by its in-memory mirror.
    pub fn in_memory(config: CoordinationConfig) -> Self {
        Self::build(None, config, BackendStatus::degraded(NO_REMOTE))
    }

    fn build(
        remote: Option<Arc<dyn RemoteStore>>,
        config: CoordinationConfig,
        initial: BackendStatus,
    ) -> Self {
        Self {
            remote,
            mirror: StateMirror::new(),
            monitor: StatusMonitor::new(COMPONENT, initial, config.probe_interval),
            config,
            agent_lock: Mutex::new(()),
            system_lock: Mutex::new(()),
            reconcile_lock: Mutex::new(()),
        }
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub fn status(&self) -> BackendStatus {
        self.monitor.status()
    }

    pub fn is_degraded(&self) -> bool {
        self.monitor.is_degraded()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BackendStatus> {
        self.monitor.subscribe()
    }

    /// Counts of mirrored entries and writes not yet persisted.
    pub fn mirror_stats(&self) -> MirrorStats {
        self.mirror.stats()
    }

    /// Ping the backing store now, regardless of the probe interval.
    pub async fn check_remote(&self) -> BackendStatus {
        match &self.remote {
            Some(remote) => {
                match with_timeout("ping", self.config.remote_timeout, remote.ping()).await {
                    Ok(()) => self.monitor.record_success(),
                    Err(err) => self.monitor.record_failure(&err),
                }
            }
            None => self.monitor.mark_degraded(NO_REMOTE),
        }
        self.status()
    }

    fn usable_remote(&self) -> Option<&dyn RemoteStore> {
        let remote = self.remote.as_deref()?;
        self.monitor.should_attempt().then_some(remote)
    }

    fn observe<T>(&self, result: &StorageResult<T>) {
        match result {
            Ok(_) => self.monitor.record_success(),
            Err(err) => self.monitor.record_failure(err),
        }
    }

    /// One bounded foreground call. A skipped attempt reads as unavailable.
    async fn fetch<'a, T, F, Fut>(&'a self, operation: &str, call: F) -> StorageResult<T>
    where
        F: FnOnce(&'a dyn RemoteStore) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let Some(remote) = self.usable_remote() else {
            return Err(StorageError::Unavailable(SKIPPED.into()));
        };
        let result = with_timeout(operation, self.config.remote_timeout, call(remote)).await;
        self.observe(&result);
        result
    }

    /// A write under the retry policy.
    async fn push<'a, F, Fut>(&'a self, operation: &str, call: F) -> StorageResult<()>
    where
        F: Fn(&'a dyn RemoteStore) -> Fut,
        Fut: Future<Output = StorageResult<()>>,
    {
        let Some(remote) = self.usable_remote() else {
            return Err(StorageError::Unavailable(SKIPPED.into()));
        };
        let call = &call;
        let result = call_with_retry(&self.config.retry, operation, move || call(remote)).await;
        self.observe(&result);
        if let Err(err) = &result {
            if err.is_transient() {
                debug!(operation = %operation, error = %err, "Write held in mirror");
            } else {
                warn!(operation = %operation, error = %err, "Backing store rejected coordination record");
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // Agent states
    // ---------------------------------------------------------------------

    /// Upsert an agent record by its composite key.
    ///
    /// The status change is checked against the stored record; a record
    /// with no stored predecessor counts as coming from `UNINITIALIZED`.
    /// If the stored record cannot be read, the change is checked against
    /// the mirror and held unpersisted until reconciliation has re-checked
    /// it against the store. Timestamps are set here. Counters are stored
    /// exactly as given.
    #[instrument(skip(self, state), fields(agent_id = %state.agent_id, session_id = %state.session_id, status = %state.status))]
    pub async fn save_agent_state(
        &self,
        state: AgentState,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        state.validate()?;
        let _guard = self.agent_lock.lock().await;
        self.save_locked(state).await
    }

    async fn save_locked(
        &self,
        mut state: AgentState,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        let key = state.key();
        let Predecessor {
            state: current,
            assumed_from,
        } = self.current_agent(&key).await;
        let from = current
            .as_ref()
            .map_or(AgentStatus::Uninitialized, |c| c.status);
        if !from.can_transition_to(state.status) {
            return Err(CoordinationError::InvalidTransition {
                key: key.document_key(),
                from,
                to: state.status,
            });
        }

        if let Some(current) = &current {
            state.created_at = current.created_at;
        }
        let now = Utc::now();
        state.last_updated = now;
        state.last_active = now;
        Ok(match assumed_from {
            None => self.store_agent(state).await,
            Some(assumed) => self.hold_agent(state, assumed),
        })
    }

    /// The stored record for `key`, falling back to the mirror if the
    /// backing store cannot answer.
    async fn current_agent(&self, key: &AgentStateKey) -> Predecessor {
        let local = self.mirror.get_agent(key);
        let held = self.mirror.assumed_from(key);
        match self
            .fetch("get_agent_state", |remote| remote.get_agent_state(key))
            .await
        {
            Ok(stored) => Predecessor {
                state: merge_agent(&self.mirror, local, stored),
                assumed_from: held,
            },
            Err(err) => {
                warn!(key = %key, error = %err, "Checking transition against mirror only");
                let assumed = held
                    .or(local.as_ref().map(|state| state.status))
                    .unwrap_or(AgentStatus::Uninitialized);
                Predecessor {
                    state: local,
                    assumed_from: Some(assumed),
                }
            }
        }
    }

    fn hold_agent(&self, state: AgentState, assumed: AgentStatus) -> WriteOutcome<AgentState> {
        debug!(key = %state.key(), assumed = %assumed, "Holding agent state until reconciliation");
        self.mirror.put_agent_provisional(state.clone(), assumed);
        WriteOutcome {
            value: state,
            persisted: false,
        }
    }

    async fn store_agent(&self, state: AgentState) -> WriteOutcome<AgentState> {
        self.mirror.put_agent(state.clone());
        let pending = &state;
        let persisted = self
            .push("put_agent_state", move |remote| remote.put_agent_state(pending))
            .await
            .is_ok();
        if persisted {
            self.mirror
                .mark_agent_persisted(&state.key(), state.last_updated);
        }
        WriteOutcome {
            value: state,
            persisted,
        }
    }

    /// The latest record for the agent in the session.
    ///
    /// Reads the backing store and the mirror; the more recently updated
    /// copy wins. `NotFound` when neither has one, `Timeout` when the store
    /// did not answer in time and the mirror has nothing to offer.
    #[instrument(skip(self))]
    pub async fn get_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> CoordinationResult<AgentState> {
        let local = self.mirror.find_agent(agent_id, session_id);
        let result = self
            .fetch("find_agent_state", |remote| {
                remote.find_agent_state(agent_id, session_id)
            })
            .await;
        resolve_agent(&self.mirror, local, result)?
            .ok_or_else(|| CoordinationError::not_found(agent_id, session_id))
    }

    /// Move an existing record to `status`.
    pub async fn transition_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        status: AgentStatus,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        self.modify_agent(agent_id, session_id, |state| state.status = status)
            .await
    }

    /// Append a task-result summary to the agent's history.
    pub async fn append_task_result(
        &self,
        agent_id: &str,
        session_id: &str,
        summary: impl Into<String>,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        let summary = summary.into();
        if summary.trim().is_empty() {
            return Err(CoordinationError::Validation(
                "task result summary must not be empty".into(),
            ));
        }
        self.modify_agent(agent_id, session_id, move |state| {
            state.task_history.push(summary)
        })
        .await
    }

    /// Add `delta` to a named performance metric, starting from zero.
    pub async fn increment_metric(
        &self,
        agent_id: &str,
        session_id: &str,
        name: &str,
        delta: f64,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        if name.trim().is_empty() || !delta.is_finite() {
            return Err(CoordinationError::Validation(format!(
                "metric {name:?} cannot be incremented by {delta}"
            )));
        }
        self.modify_agent(agent_id, session_id, |state| {
            *state
                .performance_metrics
                .entry(name.to_string())
                .or_insert(0.0) += delta;
        })
        .await
    }

    async fn modify_agent<F>(
        &self,
        agent_id: &str,
        session_id: &str,
        apply: F,
    ) -> CoordinationResult<WriteOutcome<AgentState>>
    where
        F: FnOnce(&mut AgentState),
    {
        let _guard = self.agent_lock.lock().await;
        let mut state = self.get_agent_state(agent_id, session_id).await?;
        apply(&mut state);
        state.validate()?;
        self.save_locked(state).await
    }

    /// All records, or those of one agent, most recently updated first.
    pub async fn list_agent_states(
        &self,
        agent_id: Option<&str>,
    ) -> CoordinationResult<Vec<AgentState>> {
        let mut merged: HashMap<AgentStateKey, AgentState> = HashMap::new();
        match self
            .fetch("list_agent_states", |remote| remote.list_agent_states(agent_id))
            .await
        {
            Ok(states) => {
                for state in states {
                    self.mirror.put_agent_clean(state.clone());
                    merged.insert(state.key(), state);
                }
            }
            Err(err) if err.is_transient() => {
                debug!(error = %err, "Listing agent states from mirror only");
            }
            Err(err) => return Err(err.into()),
        }

        for local in self.mirror.list_agents(agent_id) {
            let newer = merged
                .get(&local.key())
                .map_or(true, |stored| local.last_updated > stored.last_updated);
            if newer {
                merged.insert(local.key(), local);
            }
        }

        let mut states: Vec<AgentState> = merged.into_values().collect();
        states.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.key().cmp(&b.key()))
        });
        Ok(states)
    }

    /// Store a historical record as-is: no transition check, timestamps kept.
    ///
    /// An existing record updated at or after the imported one is kept and
    /// returned instead, so re-importing never rolls back live state.
    pub async fn import_agent_state(
        &self,
        state: AgentState,
    ) -> CoordinationResult<WriteOutcome<AgentState>> {
        state.validate()?;
        let _guard = self.agent_lock.lock().await;
        let key = state.key();
        if let Some(existing) = self.current_agent(&key).await.state {
            if existing.last_updated >= state.last_updated {
                debug!(key = %key, "Keeping existing agent state over imported record");
                return Ok(WriteOutcome {
                    persisted: !self.mirror.is_agent_dirty(&key),
                    value: existing,
                });
            }
        }
        Ok(self.store_agent(state).await)
    }

    // ---------------------------------------------------------------------
    // Coordination events
    // ---------------------------------------------------------------------

    /// Append an event to the log.
    ///
    /// The source agent need not have a stored record. While the emergency
    /// stop is set, a SPAWN is refused and a FAILURE event describing the
    /// attempt is appended instead.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, source = %event.source_agent_id))]
    pub async fn record_coordination_event(
        &self,
        event: CoordinationEvent,
    ) -> CoordinationResult<EventOutcome> {
        event.validate()?;

        if event.event_type == EventType::Spawn && self.get_system_state().await.emergency_stop {
            obs::emit_spawn_rejected(&event.source_agent_id, event.target_agent_id.as_deref());
            let failure_event = rejection_event(&event);
            let persisted = self.store_event(failure_event.clone()).await;
            return Ok(EventOutcome::Rejected {
                failure_event,
                persisted,
            });
        }

        let persisted = self.store_event(event.clone()).await;
        Ok(EventOutcome::Recorded { event, persisted })
    }

    /// Append a historical event without emergency-stop gating.
    pub async fn import_coordination_event(
        &self,
        event: CoordinationEvent,
    ) -> CoordinationResult<WriteOutcome<CoordinationEvent>> {
        event.validate()?;
        let persisted = self.store_event(event.clone()).await;
        Ok(WriteOutcome {
            value: event,
            persisted,
        })
    }

    async fn store_event(&self, event: CoordinationEvent) -> bool {
        self.mirror.put_event(event.clone(), true);
        let pending = &event;
        let persisted = self
            .push("append_event", move |remote| remote.append_event(pending))
            .await
            .is_ok();
        if persisted {
            self.mirror.mark_event_persisted(&event.document_key());
        }
        persisted
    }

    /// Matching events from the log and the mirror, newest first.
    pub async fn list_events(
        &self,
        filter: &EventFilter,
    ) -> CoordinationResult<Vec<CoordinationEvent>> {
        let mut merged: BTreeMap<String, CoordinationEvent> = BTreeMap::new();
        match self
            .fetch("list_events", |remote| remote.list_events(filter))
            .await
        {
            Ok(events) => {
                for event in events {
                    merged.insert(event.document_key(), event);
                }
            }
            Err(err) if err.is_transient() => {
                debug!(error = %err, "Listing events from mirror only");
            }
            Err(err) => return Err(err.into()),
        }

        let unbounded = EventFilter {
            limit: None,
            ..filter.clone()
        };
        for event in self.mirror.list_events(&unbounded) {
            merged.entry(event.document_key()).or_insert(event);
        }

        let newest_first = merged.into_values().rev();
        Ok(match filter.limit {
            Some(limit) => newest_first.take(limit).collect(),
            None => newest_first.collect(),
        })
    }

    /// Per-type counts and success rate of the matching events.
    pub async fn coordination_summary(
        &self,
        filter: &EventFilter,
    ) -> CoordinationResult<CoordinationSummary> {
        let events = self.list_events(filter).await?;
        Ok(CoordinationSummary::from_events(&events))
    }

    // ---------------------------------------------------------------------
    // System state
    // ---------------------------------------------------------------------

    /// The current system state, created from the configured defaults on
    /// first use.
    pub async fn get_system_state(&self) -> SystemState {
        let _guard = self.system_lock.lock().await;
        self.current_system_state().await
    }

    async fn current_system_state(&self) -> SystemState {
        let local = self.mirror.system();
        match self
            .fetch("get_system_state", |remote| remote.get_system_state())
            .await
        {
            Ok(Some(stored)) => {
                self.mirror.put_system_clean(stored.clone());
                match local {
                    Some(local) if local.last_updated > stored.last_updated => local,
                    _ => stored,
                }
            }
            Ok(None) => match local {
                Some(local) => local,
                None => self.store_system(self.initial_system_state()).await.value,
            },
            Err(err) => {
                debug!(error = %err, "Reading system state from mirror");
                // Not mirrored: a default written now would outrank the real
                // stored state on reconcile.
                local.unwrap_or_else(|| self.initial_system_state())
            }
        }
    }

    fn initial_system_state(&self) -> SystemState {
        let mut state = SystemState::new(&self.config.system_version);
        state.emergency_stop = self.config.emergency_stop;
        state
    }

    async fn store_system(&self, state: SystemState) -> WriteOutcome<SystemState> {
        self.mirror.put_system(state.clone());
        let pending = &state;
        let persisted = self
            .push("put_system_state", move |remote| remote.put_system_state(pending))
            .await
            .is_ok();
        if persisted {
            self.mirror.mark_system_persisted(state.last_updated);
        }
        WriteOutcome {
            value: state,
            persisted,
        }
    }

    /// Apply a partial update to the system state.
    #[instrument(skip(self, delta))]
    pub async fn update_system_state(&self, delta: &SystemStateDelta) -> WriteOutcome<SystemState> {
        let _guard = self.system_lock.lock().await;
        let mut state = self.current_system_state().await;
        delta.apply(&mut state);
        self.store_system(state).await
    }

    /// Set or clear the emergency stop.
    pub async fn set_emergency_stop(&self, enabled: bool) -> WriteOutcome<SystemState> {
        let outcome = self
            .update_system_state(&SystemStateDelta::emergency_stop(enabled))
            .await;
        if enabled {
            warn!(persisted = outcome.persisted, "Emergency stop engaged");
        } else {
            info!(persisted = outcome.persisted, "Emergency stop released");
        }
        outcome
    }

    /// Merge a historical system state into the current one.
    ///
    /// Counters take the maximum, sessions are unioned, existing metrics
    /// and flags win and the stop flag is sticky, so importing twice
    /// changes nothing.
    pub async fn import_system_state(&self, imported: SystemState) -> WriteOutcome<SystemState> {
        let _guard = self.system_lock.lock().await;
        let mut state = self.current_system_state().await;
        state.total_agents_spawned = state.total_agents_spawned.max(imported.total_agents_spawned);
        state.current_agent_count = state.current_agent_count.max(imported.current_agent_count);
        state.active_sessions.extend(imported.active_sessions);
        for (name, value) in imported.system_metrics {
            state.system_metrics.entry(name).or_insert(value);
        }
        for (name, enabled) in imported.feature_flags {
            state.feature_flags.entry(name).or_insert(enabled);
        }
        state.emergency_stop |= imported.emergency_stop;
        state.last_updated = Utc::now();
        self.store_system(state).await
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    /// Push mirror entries the backing store has not confirmed.
    ///
    /// Per key, the more recently updated copy wins: a newer stored agent
    /// or system state replaces the mirrored one instead of being
    /// overwritten. An agent state written while its stored predecessor
    /// was unreadable is pushed only if the stored status allows it;
    /// otherwise it is dropped and reported as failed. Events are
    /// append-only and pushed as they are. Never fails; what could not be
    /// pushed stays pending.
    #[instrument(name = "recall.reconcile", skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();

        let agents = self.mirror.dirty_agents();
        let events = self.mirror.dirty_events();
        let system = self.mirror.dirty_system();
        if agents.is_empty() && events.is_empty() && system.is_none() {
            return report;
        }

        let Some(remote) = self.usable_remote() else {
            let reason = if self.remote.is_some() { SKIPPED } else { NO_REMOTE };
            for pending in &agents {
                report.fail(pending.state.key().document_key(), reason);
            }
            for event in &events {
                report.fail(event.document_key(), reason);
            }
            if system.is_some() {
                report.fail("system_state", reason);
            }
            return report;
        };
        let policy = &self.config.retry;
        let mut unreachable: Option<String> = None;

        for PendingAgent {
            state,
            assumed_from,
        } in agents
        {
            let key = state.key();
            if let Some(reason) = &unreachable {
                report.fail(key.document_key(), reason.clone());
                continue;
            }
            let lookup = &key;
            let stored =
                call_with_retry(policy, "get_agent_state", move || remote.get_agent_state(lookup))
                    .await;
            self.observe(&stored);
            let result = match stored {
                Ok(Some(newer)) if newer.last_updated > state.last_updated => {
                    debug!(key = %key, "Backing store holds a newer agent state");
                    self.mirror.put_agent_clean(newer);
                    report.remote_newer += 1;
                    continue;
                }
                Ok(stored) => {
                    if let Some(reason) = rejected_transition(stored.as_ref(), &state, assumed_from)
                    {
                        warn!(key = %key, reason = %reason, "Dropping agent state the stored record does not allow");
                        self.mirror.discard_agent(&key, state.last_updated);
                        if let Some(stored) = stored {
                            self.mirror.put_agent_clean(stored);
                        }
                        report.fail(key.document_key(), reason);
                        continue;
                    }
                    let pending = &state;
                    let pushed = call_with_retry(policy, "put_agent_state", move || {
                        remote.put_agent_state(pending)
                    })
                    .await;
                    self.observe(&pushed);
                    pushed
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    self.mirror.mark_agent_persisted(&key, state.last_updated);
                    report.agent_states_pushed += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        unreachable = Some(err.to_string());
                    }
                    report.fail(key.document_key(), err.to_string());
                }
            }
        }

        for event in events {
            let key = event.document_key();
            if let Some(reason) = &unreachable {
                report.fail(key, reason.clone());
                continue;
            }
            let pending = &event;
            let result =
                call_with_retry(policy, "append_event", move || remote.append_event(pending))
                    .await;
            self.observe(&result);
            match result {
                Ok(()) => {
                    self.mirror.mark_event_persisted(&key);
                    report.events_pushed += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        unreachable = Some(err.to_string());
                    }
                    report.fail(key, err.to_string());
                }
            }
        }

        if let Some(state) = system {
            match &unreachable {
                Some(reason) => report.fail("system_state", reason.clone()),
                None => self.reconcile_system(remote, state, &mut report).await,
            }
        }

        info!(
            agent_states = report.agent_states_pushed,
            events = report.events_pushed,
            system_state = report.system_state_pushed,
            remote_newer = report.remote_newer,
            failed = report.failed,
            "Reconciled coordination mirror"
        );
        report
    }

    async fn reconcile_system(
        &self,
        remote: &dyn RemoteStore,
        state: SystemState,
        report: &mut ReconcileReport,
    ) {
        let policy = &self.config.retry;
        let stored =
            call_with_retry(policy, "get_system_state", move || remote.get_system_state()).await;
        self.observe(&stored);
        let result = match stored {
            Ok(Some(newer)) if newer.last_updated > state.last_updated => {
                self.mirror.put_system_clean(newer);
                report.remote_newer += 1;
                return;
            }
            Ok(_) => {
                let pending = &state;
                let pushed = call_with_retry(policy, "put_system_state", move || {
                    remote.put_system_state(pending)
                })
                .await;
                self.observe(&pushed);
                pushed
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.mirror.mark_system_persisted(state.last_updated);
                report.system_state_pushed = true;
            }
            Err(err) => report.fail("system_state", err.to_string()),
        }
    }
}

impl std::fmt::Debug for CoordinationStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationStateManager")
            .field("mirror", &self.mirror.stats())
            .field("has_remote", &self.remote.is_some())
            .field("status", &self.status())
            .finish()
    }
}

/// Combine a mirrored copy with a backing-store lookup, newest wins.
fn resolve_agent(
    mirror: &StateMirror,
    local: Option<AgentState>,
    remote: StorageResult<Option<AgentState>>,
) -> StorageResult<Option<AgentState>> {
    match remote {
        Ok(stored) => Ok(merge_agent(mirror, local, stored)),
        Err(err) if local.is_some() || err.is_unavailable() => Ok(local),
        Err(err) => Err(err),
    }
}

fn merge_agent(
    mirror: &StateMirror,
    local: Option<AgentState>,
    stored: Option<AgentState>,
) -> Option<AgentState> {
    let Some(stored) = stored else {
        return local;
    };
    mirror.put_agent_clean(stored.clone());
    Some(match local {
        Some(local) if local.last_updated > stored.last_updated => local,
        _ => stored,
    })
}

/// Why a held write may not replace `stored`, if it may not.
///
/// The write was checked against `assumed_from`; it stands if the store
/// still holds that status or the stored status allows the change anyway.
fn rejected_transition(
    stored: Option<&AgentState>,
    held: &AgentState,
    assumed_from: Option<AgentStatus>,
) -> Option<String> {
    let assumed = assumed_from?;
    let from = stored.map_or(AgentStatus::Uninitialized, |s| s.status);
    if from == assumed || from.can_transition_to(held.status) {
        return None;
    }
    Some(format!(
        "stored status {from} does not allow {}",
        held.status
    ))
}

/// The FAILURE event logged in place of a refused SPAWN.
fn rejection_event(attempted: &CoordinationEvent) -> CoordinationEvent {
    let mut failure = CoordinationEvent::new(
        EventType::Failure,
        &attempted.source_agent_id,
        &attempted.source_agent_type,
    )
    .with_success(false)
    .with_context("reason", json!("emergency_stop"))
    .with_context("attempted_event_id", json!(attempted.event_id))
    .with_context("attempted_event_type", json!(attempted.event_type));
    if let Some(target) = &attempted.target_agent_id {
        failure = failure
            .with_target(target.clone())
            .with_context("attempted_target", json!(target));
    }
    failure.task_context = attempted.task_context.clone();
    failure
}
