//! Pool-level counters (uses atomics; shared between submitters and the
//! drain thread).

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters updated by the submit path and the drain loop.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Requests accepted into the ring.
    submitted: AtomicU64,
    /// Responses matched to a pending task.
    completed: AtomicU64,
    /// Completed responses carrying a nonzero kernel status.
    kernel_failures: AtomicU64,
    /// Submissions rejected with `QueueFull`.
    queue_full: AtomicU64,
    /// Responses with no matching pending task, discarded.
    orphans: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, kernel_failure: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if kernel_failure {
            self.kernel_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphan(&self) {
        self.orphans.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            kernel_failures: self.kernel_failures.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub kernel_failures: u64,
    pub queue_full: u64,
    pub orphans: u64,
}
