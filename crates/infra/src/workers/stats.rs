use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::orchestrator::Disposition;

/// Counters shared by every worker of a pool.
#[derive(Debug)]
pub struct WorkerStats {
    started: Instant,
    deliveries: AtomicU64,
    advanced: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    stale: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
    poll_errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub deliveries: u64,
    /// Steps that succeeded and dispatched the next step.
    pub advanced: u64,
    /// Pipelines that finished their last step.
    pub completed: u64,
    pub retried: u64,
    /// Pipelines that failed, dead-lettered ones included.
    pub failed: u64,
    pub dead_lettered: u64,
    pub stale: u64,
    pub released: u64,
    /// Deliveries whose outcome could not be persisted.
    pub errors: u64,
    pub poll_errors: u64,
    pub uptime_secs: u64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            deliveries: AtomicU64::new(0),
            advanced: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            released: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_delivery(&self) {
        bump(&self.deliveries);
    }

    pub(crate) fn record(&self, disposition: Disposition) {
        match disposition {
            Disposition::Advanced => bump(&self.advanced),
            Disposition::Completed => bump(&self.completed),
            Disposition::Retrying => bump(&self.retried),
            Disposition::Failed => bump(&self.failed),
            Disposition::Stale => bump(&self.stale),
            Disposition::Released => bump(&self.released),
        }
    }

    pub(crate) fn record_dead_letter(&self) {
        bump(&self.dead_lettered);
    }

    pub(crate) fn record_error(&self) {
        bump(&self.errors);
    }

    pub(crate) fn record_poll_error(&self) {
        bump(&self.poll_errors);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerStatsSnapshot {
            deliveries: load(&self.deliveries),
            advanced: load(&self.advanced),
            completed: load(&self.completed),
            retried: load(&self.retried),
            failed: load(&self.failed),
            dead_lettered: load(&self.dead_lettered),
            stale: load(&self.stale),
            released: load(&self.released),
            errors: load(&self.errors),
            poll_errors: load(&self.poll_errors),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_land_in_their_counters() {
        let stats = WorkerStats::new();
        stats.record_delivery();
        stats.record(Disposition::Advanced);
        stats.record_delivery();
        stats.record(Disposition::Completed);
        stats.record_dead_letter();
        stats.record(Disposition::Failed);

        let snap = stats.snapshot();
        assert_eq!(snap.deliveries, 2);
        assert_eq!(snap.advanced, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retried, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(WorkerStats::new().snapshot()).unwrap();
        assert_eq!(json["deliveries"], 0);
        assert!(json.get("poll_errors").is_some());
    }
}
