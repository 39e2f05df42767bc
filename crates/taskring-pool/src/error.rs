//! Error types for pool operations.

use taskring::IpcError;
use thiserror::Error;

/// Errors surfaced synchronously by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Shared-memory or semaphore setup failed. Fatal at startup.
    #[error("failed to initialize worker pool: {0}")]
    Init(#[from] IpcError),

    /// The request ring is saturated. The submitter retries or rejects.
    #[error("request ring is full")]
    QueueFull,

    /// More workers requested than the shared region supports.
    #[error("too many workers requested (max: {max})")]
    TooManyWorkers {
        /// The compile-time worker limit.
        max: usize,
    },

    /// The pool has been stopped; the region is gone.
    #[error("worker pool is not running")]
    Stopped,
}

impl PoolError {
    /// Returns `true` if this is a recoverable error (`QueueFull`).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PoolError::QueueFull)
    }
}

/// Errors delivered through a task's future instead of at submit time.
///
/// A kernel-reported failure is NOT a `TaskError`: it rides in
/// `RespSlot::status` and the future resolves successfully with a nonzero
/// status for the caller to translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The pool shut down (or a worker died) before a response arrived.
    #[error("worker crashed or pool stopped before responding")]
    WorkerCrash,

    /// The task was canceled before a response arrived.
    #[error("task canceled before a response arrived")]
    Canceled,
}
