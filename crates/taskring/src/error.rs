//! Error types for region and transport operations.

use thiserror::Error;

/// Errors surfaced by the shared-memory transport.
#[derive(Debug, Error)]
pub enum IpcError {
    /// An OS call failed while creating or attaching the shared region or
    /// its semaphores. Fatal at startup.
    #[error("failed to initialize shared resources ({op}): {source}")]
    ResourceInit {
        /// The OS call that failed.
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The mapped region does not match the layout this binary was built
    /// against. Same fatal-at-startup class as `ResourceInit`.
    #[error("shared region layout mismatch: {0}")]
    LayoutMismatch(&'static str),

    /// The request ring is saturated. Synchronous and recoverable: the
    /// submitter retries or rejects.
    #[error("request ring is full")]
    QueueFull,
}

impl IpcError {
    /// Wraps the current `errno` for a failed OS call.
    pub(crate) fn os(op: &'static str) -> Self {
        IpcError::ResourceInit {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Returns `true` if this is a recoverable error (`QueueFull`).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IpcError::QueueFull)
    }
}
