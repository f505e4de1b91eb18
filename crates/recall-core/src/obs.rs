//! Structured observability hooks for Recall lifecycle events.
//!
//! Every function emits one `tracing` event with a stable `event` field so
//! log pipelines can filter on it. For JSON output run the binaries with
//! `--json`.

use tracing::{info, warn};

/// Emit event: a memory was classified and cached.
pub fn emit_memory_written(id: &str, memory_type: &str, importance: f64, links: usize) {
    info!(
        event = "memory.written",
        memory_id = %id,
        memory_type = %memory_type,
        importance = importance,
        links = links,
    );
}

/// Emit event: a sync pass finished.
pub fn emit_sync_finished(synced: usize, failed: usize, deletes: usize, duration_ms: u64) {
    info!(
        event = "sync.finished",
        synced = synced,
        failed = failed,
        deletes = deletes,
        duration_ms = duration_ms,
    );
}

/// Emit event: the backing store became unreachable (warning level).
pub fn emit_store_degraded(component: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "store.degraded", component = %component, reason = %reason);
}

/// Emit event: the backing store answered again after an outage.
pub fn emit_store_recovered(component: &str, outage_ms: u64) {
    info!(event = "store.recovered", component = %component, outage_ms = outage_ms);
}

/// Emit event: a consolidation pass finished.
pub fn emit_consolidation_finished(
    scanned: usize,
    deleted: usize,
    updated: usize,
    skipped: usize,
) {
    info!(
        event = "consolidation.finished",
        scanned = scanned,
        deleted = deleted,
        updated = updated,
        skipped = skipped,
    );
}

/// Emit event: a SPAWN was refused because of the emergency stop.
pub fn emit_spawn_rejected(source_agent_id: &str, target_agent_id: Option<&str>) {
    warn!(
        event = "coordination.spawn_rejected",
        source_agent_id = %source_agent_id,
        target_agent_id = target_agent_id.unwrap_or("-"),
        reason = "emergency_stop",
    );
}

/// Emit event: a migration batch finished.
pub fn emit_migration_finished(migrated: usize, failed: usize, dry_run: bool) {
    info!(
        event = "migration.finished",
        migrated = migrated,
        failed = failed,
        dry_run = dry_run,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        emit_memory_written("m1", "GOAL", 0.8, 2);
        emit_sync_finished(3, 1, 0, 12);
        emit_store_degraded("memory", &"connection refused");
        emit_store_recovered("memory", 1_500);
        emit_consolidation_finished(10, 2, 1, 0);
        emit_spawn_rejected("planner", Some("worker-1"));
        emit_migration_finished(5, 1, true);
    }
}
