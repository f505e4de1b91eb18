//! Background worker: periodic sync, consolidation and reconciliation.
//!
//! A single task owns all three schedules so remote traffic from the
//! background path is never concurrent with itself. Foreground calls on
//! the store and manager keep running against the cache and mirror.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationStateManager, ReconcileReport};
use crate::memory::{ConsolidationPolicy, SyncReport, TieredMemoryStore};

/// When each background job runs.
#[derive(Debug, Clone)]
pub struct WorkerSchedule {
    pub sync_interval: Duration,
    /// `None` disables consolidation.
    pub consolidation_interval: Option<Duration>,
    pub consolidation_policy: ConsolidationPolicy,
    pub reconcile_interval: Duration,
}

/// What the worker did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub sync_passes: u64,
    pub consolidation_passes: u64,
    pub reconcile_passes: u64,
    /// Flush performed on shutdown.
    pub final_sync: SyncReport,
    pub final_reconcile: ReconcileReport,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// Stop the worker after a final flush and return its summary.
    pub async fn shutdown(self) -> WorkerSummary {
        // A send error means the task already exited.
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "Background worker did not exit cleanly");
                WorkerSummary::default()
            }
        }
    }
}

/// Start the background worker on the current tokio runtime.
pub fn spawn_worker(
    memory: Arc<TieredMemoryStore>,
    coordination: Arc<CoordinationStateManager>,
    schedule: WorkerSchedule,
) -> WorkerHandle {
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(run(memory, coordination, schedule, rx));
    WorkerHandle { shutdown, task }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run(
    memory: Arc<TieredMemoryStore>,
    coordination: Arc<CoordinationStateManager>,
    schedule: WorkerSchedule,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerSummary {
    let mut summary = WorkerSummary::default();
    let mut sync_tick = ticker(schedule.sync_interval);
    let mut reconcile_tick = ticker(schedule.reconcile_interval);
    let consolidation_enabled = schedule.consolidation_interval.is_some();
    let mut consolidation_tick = ticker(
        schedule
            .consolidation_interval
            .unwrap_or(Duration::from_secs(86_400)),
    );

    info!(
        sync_secs = schedule.sync_interval.as_secs_f64(),
        reconcile_secs = schedule.reconcile_interval.as_secs_f64(),
        consolidation = consolidation_enabled,
        "Background worker started"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = sync_tick.tick() => {
                let report = memory.sync().await;
                summary.sync_passes += 1;
                debug!(synced = report.synced_count, failed = report.failed_count, "Periodic sync");
            }
            _ = reconcile_tick.tick() => {
                coordination.reconcile().await;
                summary.reconcile_passes += 1;
            }
            _ = consolidation_tick.tick(), if consolidation_enabled => {
                match memory.consolidate(&schedule.consolidation_policy).await {
                    Ok(_) => summary.consolidation_passes += 1,
                    Err(err) => warn!(error = %err, "Consolidation pass failed"),
                }
            }
        }
    }

    summary.final_sync = memory.sync().await;
    summary.final_reconcile = coordination.reconcile().await;
    info!(
        sync_passes = summary.sync_passes,
        reconcile_passes = summary.reconcile_passes,
        consolidation_passes = summary.consolidation_passes,
        unsynced = summary.final_sync.failed_count,
        "Background worker stopped"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationConfig;
    use crate::memory::MemoryStoreConfig;
    use recall_state::fakes::MemoryRemoteStore;
    use recall_state::{AgentState, AgentStatus};
    use std::collections::BTreeSet;

    fn schedule(period: Duration) -> WorkerSchedule {
        WorkerSchedule {
            sync_interval: period,
            consolidation_interval: Some(period),
            consolidation_policy: ConsolidationPolicy::new(Duration::from_secs(86_400 * 30), 0.1),
            reconcile_interval: period,
        }
    }

    async fn components(
        fake: &Arc<MemoryRemoteStore>,
    ) -> (Arc<TieredMemoryStore>, Arc<CoordinationStateManager>) {
        let memory = TieredMemoryStore::open(fake.clone(), MemoryStoreConfig::default()).await;
        let coordination =
            CoordinationStateManager::open(fake.clone(), CoordinationConfig::default()).await;
        (Arc::new(memory), Arc::new(coordination))
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let fake = Arc::new(MemoryRemoteStore::new());
        let (memory, coordination) = components(&fake).await;
        memory
            .write("Decision: keep the cache coarse-grained", BTreeSet::new())
            .unwrap();

        let worker = spawn_worker(memory.clone(), coordination, schedule(Duration::from_secs(3_600)));
        let summary = worker.shutdown().await;

        assert_eq!(summary.final_sync.synced_count, 1);
        assert_eq!(fake.memory_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_passes_run() {
        let fake = Arc::new(MemoryRemoteStore::new());
        let (memory, coordination) = components(&fake).await;
        let worker = spawn_worker(memory.clone(), coordination.clone(), schedule(Duration::from_secs(10)));

        memory.write("Task: add retry", BTreeSet::new()).unwrap();
        fake.set_available(false);
        coordination
            .save_agent_state(AgentState::new("a1", "coder", "s1").with_status(AgentStatus::Active))
            .await
            .unwrap();
        fake.set_available(true);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fake.memory_count(), 1);
        assert_eq!(fake.agent_state_count(), 1);

        let summary = worker.shutdown().await;
        assert!(summary.sync_passes >= 2);
        assert!(summary.reconcile_passes >= 2);
        assert!(summary.consolidation_passes >= 2);
        assert_eq!(summary.final_sync, SyncReport::default());
    }
}
