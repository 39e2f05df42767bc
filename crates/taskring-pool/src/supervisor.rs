//! Launch, track, and tear down the worker processes.
//!
//! Children are the same binary re-executed with `--worker`; they cooperate
//! with the host only through the shared region. The fork discipline is
//! strict: argv is prepared before the fork so the child touches nothing but
//! `execv` and `_exit` between fork and exec.

use crate::config::PoolConfig;
use crate::correlator::{TaskCorrelator, TaskHandle};
use crate::error::{PoolError, TaskError};
use crate::metrics::MetricsSnapshot;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use taskring::{IpcError, ReqSlot, RespSlot, SharedRegion, TaskType, MAX_WORKERS};
use tracing::{info, warn};

/// How long `stop` keeps retrying a shutdown broadcast into a full ring
/// before giving up on that sentinel.
const SHUTDOWN_ENQUEUE_RETRIES: u32 = 2000;
const SHUTDOWN_ENQUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// The host-side pool: shared region owner, drain thread, and children.
///
/// # Example
///
/// ```no_run
/// use taskring_pool::{PoolConfig, WorkerPool};
///
/// let exec = std::env::current_exe()?;
/// let mut pool = WorkerPool::start(PoolConfig::new(4), &exec)?;
/// let handle = pool.submit_text("test message")?;
/// let resp = handle.wait()?;
/// assert_eq!(resp.text_bytes(), b"egassem tset");
/// pool.stop();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct WorkerPool {
    region: Arc<SharedRegion>,
    correlator: Arc<TaskCorrelator>,
    drain: Option<JoinHandle<()>>,
    pids: Vec<libc::pid_t>,
    exec_path: PathBuf,
    config: PoolConfig,
    running: AtomicBool,
}

impl WorkerPool {
    /// Creates the shared region, spawns the drain thread, and forks
    /// `config.workers` children executing `exec_path --worker ...`.
    ///
    /// A child that fails to fork is logged and skipped; the pool starts
    /// with the children that did fork. Fatal resource errors abort before
    /// anything is left behind.
    pub fn start(config: PoolConfig, exec_path: &Path) -> Result<Self, PoolError> {
        if config.workers > MAX_WORKERS {
            return Err(PoolError::TooManyWorkers { max: MAX_WORKERS });
        }

        let region = Arc::new(SharedRegion::create_host(config.region_config())?);
        let correlator = Arc::new(TaskCorrelator::new());

        let drain = {
            let region = Arc::clone(&region);
            let correlator = Arc::clone(&correlator);
            thread::Builder::new()
                .name("taskring-drain".to_owned())
                .spawn(move || correlator.drain_loop(&region))
                .map_err(|source| {
                    PoolError::Init(IpcError::ResourceInit {
                        op: "spawn drain thread",
                        source,
                    })
                })?
        };

        let mut pids = Vec::with_capacity(config.workers);
        for slot in 0..config.workers {
            match spawn_worker(exec_path, &config) {
                Ok(pid) => pids.push(pid),
                Err(err) => warn!(slot, error = %err, "failed to fork worker"),
            }
        }
        info!(
            workers = pids.len(),
            requested = config.workers,
            shm = %config.region_config().shm_name,
            "worker pool started"
        );

        Ok(Self {
            region,
            correlator,
            drain: Some(drain),
            pids,
            exec_path: exec_path.to_path_buf(),
            config,
            running: AtomicBool::new(true),
        })
    }

    /// Submits a prepared request and returns its future.
    pub fn submit(&self, req: Box<ReqSlot>) -> Result<TaskHandle, PoolError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        self.correlator.submit(&self.region, req)
    }

    /// Submits a text-transform task.
    pub fn submit_text(&self, text: &str) -> Result<TaskHandle, PoolError> {
        self.submit(ReqSlot::text(text.as_bytes()))
    }

    /// Submits an audio feature-extraction task.
    pub fn submit_audio(&self, sample_rate: u32, samples: &[f32]) -> Result<TaskHandle, PoolError> {
        self.submit(ReqSlot::audio(sample_rate, samples))
    }

    /// Best-effort cancellation of an outstanding task. The ring entry is
    /// not recalled; a response that still arrives is discarded as an
    /// orphan.
    pub fn cancel(&self, task_id: u64) -> bool {
        self.correlator.cancel(task_id)
    }

    /// Enqueues a single shutdown sentinel; one worker will terminate.
    /// Used by tests and for graceful pool contraction.
    pub fn shutdown_one(&self) -> Result<(), PoolError> {
        match self.region.enqueue_request(&ReqSlot::shutdown()) {
            Ok(()) => Ok(()),
            Err(IpcError::QueueFull) => Err(PoolError::QueueFull),
            Err(other) => Err(PoolError::Init(other)),
        }
    }

    /// Broadcasts shutdown, reaps every child, stops the drain thread, and
    /// destroys the region. Idempotent.
    ///
    /// Ordering matters: children are reaped first so every response they
    /// produced is already in the ring; the drain thread is then woken with
    /// a sentinel response it receives after draining those (the ring is
    /// FIFO at the token level); finally, anything still pending can never
    /// complete and is failed with `WorkerCrash`.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(workers = self.pids.len(), "stopping worker pool");

        let sentinel = ReqSlot::shutdown();
        for _ in 0..self.pids.len() {
            let mut delivered = false;
            for _ in 0..SHUTDOWN_ENQUEUE_RETRIES {
                match self.region.enqueue_request(&sentinel) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(IpcError::QueueFull) => thread::sleep(SHUTDOWN_ENQUEUE_BACKOFF),
                    Err(err) => {
                        warn!(error = %err, "shutdown broadcast failed");
                        break;
                    }
                }
            }
            if !delivered {
                warn!("request ring stayed full during shutdown broadcast");
            }
        }

        for pid in self.pids.drain(..) {
            match reap(pid, 0) {
                Ok(Some(status)) if !exited_cleanly(status) => {
                    warn!(pid, status, "worker exited uncleanly");
                }
                Ok(_) => {}
                Err(err) => warn!(pid, error = %err, "waitpid failed"),
            }
        }

        // Wake the drain thread: a response with the shutdown type is its
        // stop condition, and every real response was enqueued before it.
        let mut wake = RespSlot::new_boxed();
        wake.task_type = TaskType::Shutdown as u32;
        if let Err(err) = self.region.enqueue_response(&wake) {
            warn!(error = %err, "failed to wake drain thread");
        }
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }

        let abandoned = self.correlator.fail_all_pending(TaskError::WorkerCrash);
        if abandoned > 0 {
            info!(abandoned, "pending tasks failed with WorkerCrash at stop");
        }

        self.region.detach();
        info!("worker pool stopped");
    }

    /// Sweeps for children that died uncleanly and forks replacements,
    /// keeping the pool at its configured size. Returns how many were
    /// replaced.
    ///
    /// Task-to-worker affinity is not tracked, so promises held by a dead
    /// child are not failed here; they resolve at `stop` or time out at the
    /// caller layer.
    pub fn revive_crashed(&mut self) -> usize {
        let mut revived = 0;
        let mut alive = Vec::with_capacity(self.pids.len());

        for pid in self.pids.drain(..) {
            match reap(pid, libc::WNOHANG) {
                Ok(None) => alive.push(pid),
                Ok(Some(status)) if exited_cleanly(status) => {
                    // Graceful contraction (shutdown_one); not replaced.
                    info!(pid, "worker exited cleanly");
                }
                Ok(Some(status)) => {
                    warn!(pid, status, "worker died; forking replacement");
                    match spawn_worker(&self.exec_path, &self.config) {
                        Ok(new_pid) => {
                            alive.push(new_pid);
                            revived += 1;
                        }
                        Err(err) => warn!(error = %err, "failed to fork replacement"),
                    }
                }
                Err(err) => warn!(pid, error = %err, "waitpid failed"),
            }
        }

        self.pids = alive;
        revived
    }

    /// Pids of the children currently tracked.
    pub fn worker_pids(&self) -> &[libc::pid_t] {
        &self.pids
    }

    /// Number of children currently tracked.
    pub fn worker_count(&self) -> usize {
        self.pids.len()
    }

    /// Point-in-time pool counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.correlator.metrics()
    }

    /// Submissions still awaiting a response.
    pub fn pending_tasks(&self) -> usize {
        self.correlator.pending_len()
    }

    /// The underlying shared region (host role).
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forks one child and replaces its image with `exec_path --worker ...`.
///
/// Everything that allocates happens before the fork; between fork and exec
/// the child only performs async-signal-safe calls.
fn spawn_worker(exec_path: &Path, config: &PoolConfig) -> Result<libc::pid_t, PoolError> {
    let mut args: Vec<CString> = Vec::new();
    args.push(arg_cstring(exec_path.as_os_str().as_bytes())?);
    args.push(arg_cstring(b"--worker")?);
    if let Some(run_id) = &config.run_id {
        args.push(arg_cstring(b"--run-id")?);
        args.push(arg_cstring(run_id.as_bytes())?);
    }
    for extra in &config.extra_worker_args {
        args.push(arg_cstring(extra.as_bytes())?);
    }

    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());

    // SAFETY: post-fork the child calls only execv and _exit; argv outlives
    // both (on success the image is replaced, on failure the child exits).
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(PoolError::Init(IpcError::ResourceInit {
            op: "fork",
            source: io::Error::last_os_error(),
        })),
        0 => {
            // Child. Never return from here into the host's stack.
            // SAFETY: argv is NULL-terminated and its strings are live.
            unsafe {
                libc::execv(args[0].as_ptr(), argv.as_ptr());
                // Exec failed; the parent's reap will observe the status.
                libc::_exit(1);
            }
        }
        pid => Ok(pid),
    }
}

fn arg_cstring(bytes: &[u8]) -> Result<CString, PoolError> {
    CString::new(bytes).map_err(|_| {
        PoolError::Init(IpcError::ResourceInit {
            op: "worker argv",
            source: io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL in argument"),
        })
    })
}

/// `waitpid` with EINTR retry. `Ok(None)` means still running (only with
/// `WNOHANG`); `Ok(Some(status))` is the raw wait status of a reaped child.
fn reap(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<libc::c_int>, io::Error> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: plain waitpid on a pid this process forked.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == pid {
            return Ok(Some(status));
        }
        if rc == 0 && flags & libc::WNOHANG != 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

fn exited_cleanly(status: libc::c_int) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}
