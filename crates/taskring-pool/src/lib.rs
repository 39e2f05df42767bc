//! taskring-pool: worker-process lifecycle and task correlation.
//!
//! This crate turns the [`taskring`] transport into a usable offload pool:
//! the host forks a fixed set of children re-executing its own binary with
//! `--worker`, a dedicated drain thread consumes the response ring, and
//! every submission returns a handle that resolves when its response comes
//! back, matched by task id.
//!
//! # Architecture
//!
//! ```text
//! host threads ──submit()──▶ request ring ──▶ worker processes
//!      ▲                                            │
//!      │                                       kernel.text /
//!  TaskHandle ◀── drain thread ◀─ response ring ◀── kernel.audio
//! ```
//!
//! Completion order is unrelated to submission order (workers run
//! concurrently), so the drain thread correlates strictly by task id.
//!
//! # Example
//!
//! ```no_run
//! use taskring_pool::{PoolConfig, WorkerPool};
//!
//! let exec = std::env::current_exe()?;
//! let mut pool = WorkerPool::start(PoolConfig::new(4), &exec)?;
//!
//! let task = pool.submit_text("test message")?;
//! let resp = task.wait()?;
//! assert!(resp.is_success());
//! assert_eq!(resp.text_bytes(), b"egassem tset");
//!
//! pool.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod correlator;
mod error;
mod kernel;
mod metrics;
mod supervisor;
mod worker;

pub use config::PoolConfig;
pub use correlator::{TaskCorrelator, TaskHandle};
pub use error::{PoolError, TaskError};
pub use kernel::{KernelError, MockKernel, WorkerKernel};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use supervisor::WorkerPool;
pub use worker::{run_worker, STATUS_UNKNOWN_TASK};

// The transport types riding through this API.
pub use taskring::{RegionConfig, ReqSlot, RespSlot, TaskType, MAX_WORKERS};
