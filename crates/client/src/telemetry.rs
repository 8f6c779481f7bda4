//! Session telemetry: per-sync counters and a bounded log of categorized
//! failures. Purely observational; nothing in the sync path branches on it.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{QueueId, SyncProgress};

/// Most recent failures kept in memory.
pub const MAX_FAILURE_RECORDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Auth,
    Timeout,
    Server,
    Storage,
    Conflict,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub queue_id: Option<QueueId>,
    pub message: String,
    /// Whether the item was dropped from the queue because of this failure.
    pub permanent: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub syncs_started: u64,
    pub syncs_completed: u64,
    pub syncs_aborted: u64,
    pub items_synced: u64,
    pub items_retried: u64,
    pub items_failed: u64,
    pub last_progress: Option<SyncProgress>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Default)]
pub struct SessionTelemetry {
    state: Mutex<TelemetryState>,
}

#[derive(Debug, Default)]
struct TelemetryState {
    syncs_started: u64,
    syncs_completed: u64,
    syncs_aborted: u64,
    items_synced: u64,
    items_retried: u64,
    items_failed: u64,
    last_progress: Option<SyncProgress>,
    failures: VecDeque<FailureRecord>,
}

impl SessionTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_started(&self) {
        self.update(|s| s.syncs_started += 1);
    }

    pub fn sync_finished(&self, progress: SyncProgress) {
        self.update(|s| {
            s.syncs_completed += 1;
            s.last_progress = Some(progress);
        });
    }

    pub fn sync_aborted(&self, progress: SyncProgress) {
        self.update(|s| {
            s.syncs_aborted += 1;
            s.last_progress = Some(progress);
        });
    }

    pub fn item_synced(&self) {
        self.update(|s| s.items_synced += 1);
    }

    pub fn item_retried(&self) {
        self.update(|s| s.items_retried += 1);
    }

    /// Record a failure; `permanent` failures also count as dropped items.
    pub fn record_failure(
        &self,
        category: FailureCategory,
        queue_id: Option<QueueId>,
        message: impl Into<String>,
        permanent: bool,
    ) {
        let record = FailureRecord {
            category,
            queue_id,
            message: message.into(),
            permanent,
            at: Utc::now(),
        };
        self.update(|s| {
            if permanent {
                s.items_failed += 1;
            }
            if s.failures.len() == MAX_FAILURE_RECORDS {
                s.failures.pop_front();
            }
            s.failures.push_back(record);
        });
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let Ok(s) = self.state.lock() else {
            return TelemetrySnapshot::default();
        };
        TelemetrySnapshot {
            syncs_started: s.syncs_started,
            syncs_completed: s.syncs_completed,
            syncs_aborted: s.syncs_aborted,
            items_synced: s.items_synced,
            items_retried: s.items_retried,
            items_failed: s.items_failed,
            last_progress: s.last_progress,
            failures: s.failures.iter().cloned().collect(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut TelemetryState)) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(_) => warn!("telemetry state poisoned; dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_failures_are_recorded() {
        let telemetry = SessionTelemetry::new();
        telemetry.sync_started();
        telemetry.item_synced();
        telemetry.item_retried();
        telemetry.record_failure(FailureCategory::Server, Some(3), "HTTP 500", false);
        telemetry.record_failure(FailureCategory::Conflict, Some(4), "key reused", true);
        telemetry.sync_finished(SyncProgress { total: 3, synced: 1, failed: 1, retrying: 1 });

        let snap = telemetry.snapshot();
        assert_eq!(snap.syncs_started, 1);
        assert_eq!(snap.syncs_completed, 1);
        assert_eq!(snap.items_synced, 1);
        assert_eq!(snap.items_retried, 1);
        assert_eq!(snap.items_failed, 1);
        assert_eq!(snap.failures.len(), 2);
        assert_eq!(snap.failures[1].category, FailureCategory::Conflict);
        assert_eq!(snap.last_progress.unwrap().total, 3);
    }

    #[test]
    fn failure_log_is_bounded() {
        let telemetry = SessionTelemetry::new();
        for i in 0..(MAX_FAILURE_RECORDS as i64 + 10) {
            telemetry.record_failure(FailureCategory::Timeout, Some(i), "timeout", false);
        }
        let snap = telemetry.snapshot();
        assert_eq!(snap.failures.len(), MAX_FAILURE_RECORDS);
        assert_eq!(snap.failures[0].queue_id, Some(10));
    }
}
