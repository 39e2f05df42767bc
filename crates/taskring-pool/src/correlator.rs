//! Correlation of asynchronous responses to outstanding submissions.
//!
//! Task ids are the only thing that crosses back from a worker, so the
//! correlator owns the id counter and a map of pending promises. The map
//! mutex is held only for O(1) insert/remove; fulfillment always happens
//! outside the lock so a slow waiter never blocks producers.

use crate::error::{PoolError, TaskError};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use taskring::{IpcError, ReqSlot, RespSlot, SharedRegion, TaskType};
use tracing::debug;

type TaskResult = Result<Box<RespSlot>, TaskError>;
type Promise = tokio::sync::oneshot::Sender<TaskResult>;

/// The future half of a submission. Resolves when the assigned worker's
/// response is drained, or with [`TaskError`] if that can no longer happen.
pub struct TaskHandle {
    task_id: u64,
    rx: tokio::sync::oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// The id stamped into the request; stable for the host's lifetime.
    #[inline]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Blocks the calling thread until the response arrives.
    ///
    /// A nonzero kernel status is NOT an error here: the response slot is
    /// returned and the caller inspects `RespSlot::status`.
    pub fn wait(self) -> TaskResult {
        self.rx.blocking_recv().map_err(|_| TaskError::WorkerCrash)?
    }

    /// Non-blocking poll: `None` while the response is still outstanding.
    pub fn try_wait(&mut self) -> Option<TaskResult> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TaskError::WorkerCrash)),
        }
    }
}

/// Assigns task ids, holds pending promises, and fulfills them from the
/// drain loop.
pub struct TaskCorrelator {
    /// Monotonic id source. Starts at 1; 0 is reserved for sentinels.
    next_task_id: AtomicU64,
    pending: Mutex<HashMap<u64, Promise>>,
    metrics: PoolMetrics,
}

impl TaskCorrelator {
    pub fn new() -> Self {
        Self {
            next_task_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            metrics: PoolMetrics::default(),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Promise>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps `req` with a fresh task id and enqueue timestamp, registers a
    /// promise, and enqueues the request.
    ///
    /// On `QueueFull` the registration is rolled back and the error is
    /// surfaced synchronously; the map never leaks an entry for a request
    /// that was not accepted.
    pub fn submit(
        &self,
        region: &SharedRegion,
        mut req: Box<ReqSlot>,
    ) -> Result<TaskHandle, PoolError> {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        req.task_id = task_id;
        req.enqueue_ts_ns = unix_nanos();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.lock_pending().insert(task_id, tx);

        match region.enqueue_request(&req) {
            Ok(()) => {
                self.metrics.record_submitted();
                Ok(TaskHandle { task_id, rx })
            }
            Err(err) => {
                self.lock_pending().remove(&task_id);
                match err {
                    IpcError::QueueFull => {
                        self.metrics.record_queue_full();
                        Err(PoolError::QueueFull)
                    }
                    other => Err(PoolError::Init(other)),
                }
            }
        }
    }

    /// Routes one drained response to its promise. Returns `false` for an
    /// orphan (canceled task, or a duplicate response): logged, counted,
    /// never fatal.
    pub fn fulfill(&self, resp: &RespSlot) -> bool {
        let promise = self.lock_pending().remove(&resp.task_id);
        match promise {
            Some(tx) => {
                self.metrics.record_completed(!resp.is_success());
                // The waiter may already have dropped its handle; that is
                // its business, not ours.
                let _ = tx.send(Ok(Box::new(*resp)));
                true
            }
            None => {
                self.metrics.record_orphan();
                debug!(task_id = resp.task_id, "discarding orphan response");
                false
            }
        }
    }

    /// Best-effort cancellation: erases the pending entry so the waiter
    /// resolves immediately. A response that later arrives for this id is
    /// discarded as an orphan.
    pub fn cancel(&self, task_id: u64) -> bool {
        match self.lock_pending().remove(&task_id) {
            Some(tx) => {
                let _ = tx.send(Err(TaskError::Canceled));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding promise. Called during pool shutdown after
    /// the drain thread has been joined.
    pub fn fail_all_pending(&self, err: TaskError) -> usize {
        let drained: Vec<Promise> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err));
        }
        count
    }

    /// The host drain loop: consume responses and fulfill promises until
    /// the shutdown sentinel (a response with the shutdown type) arrives.
    ///
    /// Runs on the single dedicated drain thread, the response ring's one
    /// consumer.
    pub fn drain_loop(&self, region: &SharedRegion) {
        let mut resp = RespSlot::new_boxed();
        loop {
            if region.dequeue_response(&mut resp).is_err() {
                debug!("drain loop stopping on semaphore error");
                break;
            }
            if resp.kind() == Some(TaskType::Shutdown) {
                debug!("drain loop received shutdown sentinel");
                break;
            }
            self.fulfill(&resp);
        }
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of submissions still awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }
}

impl Default for TaskCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use taskring::RegionConfig;

    fn unique_region() -> SharedRegion {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let id = SEQ.fetch_add(1, Ordering::Relaxed);
        let config = RegionConfig::for_run(&format!("correlator-{}-{id}", std::process::id()));
        SharedRegion::create_host(config).unwrap()
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let a = correlator.submit(&region, ReqSlot::text(b"a")).unwrap();
        let b = correlator.submit(&region, ReqSlot::text(b"b")).unwrap();
        assert_eq!(a.task_id(), 1);
        assert_eq!(b.task_id(), 2);
        assert_eq!(correlator.pending_len(), 2);
    }

    #[test]
    fn fulfill_resolves_the_matching_handle() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let handle = correlator.submit(&region, ReqSlot::text(b"hi")).unwrap();

        let mut resp = RespSlot::new_boxed();
        resp.task_id = handle.task_id();
        assert!(correlator.fulfill(&resp));
        assert_eq!(correlator.pending_len(), 0);

        let got = handle.wait().unwrap();
        assert_eq!(got.task_id, 1);
    }

    #[test]
    fn try_wait_polls_without_blocking() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let mut handle = correlator.submit(&region, ReqSlot::text(b"poll")).unwrap();
        assert!(handle.try_wait().is_none());

        let mut resp = RespSlot::new_boxed();
        resp.task_id = handle.task_id();
        correlator.fulfill(&resp);
        assert!(matches!(handle.try_wait(), Some(Ok(_))));
    }

    #[test]
    fn orphan_responses_are_discarded() {
        let correlator = TaskCorrelator::new();
        let mut resp = RespSlot::new_boxed();
        resp.task_id = 999;
        assert!(!correlator.fulfill(&resp));
        assert_eq!(correlator.metrics().orphans, 1);
    }

    #[test]
    fn cancel_then_response_is_an_orphan() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let handle = correlator.submit(&region, ReqSlot::text(b"hi")).unwrap();
        let task_id = handle.task_id();
        assert!(correlator.cancel(task_id));
        assert!(matches!(handle.wait(), Err(TaskError::Canceled)));

        let mut resp = RespSlot::new_boxed();
        resp.task_id = task_id;
        assert!(!correlator.fulfill(&resp));
    }

    #[test]
    fn queue_full_rolls_back_the_pending_entry() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let req = ReqSlot::text(b"fill");
        let mut handles = Vec::new();
        for _ in 0..taskring::RING_CAP {
            handles.push(correlator.submit(&region, req.clone()).unwrap());
        }
        let err = correlator.submit(&region, req.clone()).map(|_| ()).unwrap_err();
        assert!(matches!(err, PoolError::QueueFull));
        assert_eq!(correlator.pending_len(), taskring::RING_CAP);
        assert_eq!(correlator.metrics().queue_full, 1);
    }

    #[test]
    fn fail_all_pending_resolves_every_handle() {
        let region = unique_region();
        let correlator = TaskCorrelator::new();

        let a = correlator.submit(&region, ReqSlot::text(b"a")).unwrap();
        let b = correlator.submit(&region, ReqSlot::text(b"b")).unwrap();
        assert_eq!(correlator.fail_all_pending(TaskError::WorkerCrash), 2);
        assert!(matches!(a.wait(), Err(TaskError::WorkerCrash)));
        assert!(matches!(b.wait(), Err(TaskError::WorkerCrash)));
    }
}
