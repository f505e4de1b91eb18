//! Observable connectivity status for components backed by a [`RemoteStore`].
//!
//! [`StatusMonitor`] turns individual call outcomes into explicit mode
//! transitions (`Connected` <-> `Degraded`), publishes them on a `watch`
//! channel and rate-limits remote attempts while degraded.
//!
//! [`RemoteStore`]: recall_state::RemoteStore

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_state::StorageError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::obs;

/// Connectivity of a component to its backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackendStatus {
    Connected,
    Degraded {
        since: DateTime<Utc>,
        reason: String,
    },
}

impl BackendStatus {
    pub fn degraded(reason: impl Into<String>) -> Self {
        BackendStatus::Degraded {
            since: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, BackendStatus::Connected)
    }

    pub fn is_degraded(&self) -> bool {
        !self.is_connected()
    }
}

/// Tracks and publishes [`BackendStatus`] transitions.
#[derive(Debug)]
pub struct StatusMonitor {
    component: &'static str,
    tx: watch::Sender<BackendStatus>,
    probe_interval: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl StatusMonitor {
    pub fn new(component: &'static str, initial: BackendStatus, probe_interval: Duration) -> Self {
        if let BackendStatus::Degraded { reason, .. } = &initial {
            obs::emit_store_degraded(component, reason);
        }
        let (tx, _rx) = watch::channel(initial);
        Self {
            component,
            tx,
            probe_interval,
            last_attempt: Mutex::new(Some(Instant::now())),
        }
    }

    pub fn status(&self) -> BackendStatus {
        self.tx.borrow().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.tx.borrow().is_degraded()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.tx.subscribe()
    }

    /// Whether a remote call should be attempted now.
    ///
    /// Always true while connected. While degraded, true at most once per
    /// probe interval; the caller's outcome then decides the next mode.
    pub fn should_attempt(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        let mut last = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let due = last
            .map(|at| now.duration_since(at) >= self.probe_interval)
            .unwrap_or(true);
        if due {
            *last = Some(now);
        }
        due
    }

    /// A remote call succeeded.
    pub fn record_success(&self) {
        let mut outage = None;
        self.tx.send_if_modified(|status| match status {
            BackendStatus::Degraded { since, .. } => {
                outage = Some(Utc::now() - *since);
                *status = BackendStatus::Connected;
                true
            }
            BackendStatus::Connected => false,
        });
        if let Some(outage) = outage {
            obs::emit_store_recovered(self.component, outage.num_milliseconds().max(0) as u64);
        }
    }

    /// A remote call failed. Only unreachability (unavailable or timed out)
    /// changes the mode; other failures are the caller's to report.
    pub fn record_failure(&self, err: &StorageError) {
        if matches!(
            err,
            StorageError::Unavailable(_) | StorageError::Timeout { .. }
        ) {
            self.mark_degraded(err.to_string());
        }
    }

    /// Force degraded mode, e.g. when no backing store could be opened.
    pub fn mark_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.tx.send_if_modified(|status| {
            if status.is_connected() {
                *status = BackendStatus::degraded(reason.clone());
                true
            } else {
                false
            }
        });
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        if changed {
            obs::emit_store_degraded(self.component, &reason);
        }
    }
}
