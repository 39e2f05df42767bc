//! The worker-side event loop: dequeue, dispatch to the kernel, respond.

use crate::kernel::{KernelError, WorkerKernel};
use std::time::Instant;
use taskring::{IpcError, RegionConfig, ReqSlot, RespSlot, SharedRegion, TaskType};
use tracing::{debug, info, warn};

/// Status returned for a request whose type decodes to no known task.
pub const STATUS_UNKNOWN_TASK: u32 = 400;

/// Lifecycle of one worker loop. Transitions happen on loop entry, first
/// dequeue, shutdown receipt, and return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Detached,
    Attached,
    Running,
    Draining,
}

fn transition(state: &mut WorkerState, next: WorkerState) {
    debug!(from = ?*state, to = ?next, "worker state");
    *state = next;
}

/// Runs a worker process (or in-process consumer thread) to completion.
///
/// Attaches to the shared region, serves requests through `kernel`, and
/// returns after the shutdown sentinel. Each response carries the request's
/// task id and type, the kernel status, and the processing time in
/// nanoseconds.
pub fn run_worker(config: RegionConfig, kernel: &dyn WorkerKernel) -> Result<(), IpcError> {
    let mut state = WorkerState::Detached;
    let region = SharedRegion::attach_worker(config)?;
    transition(&mut state, WorkerState::Attached);
    info!(shm = %region.config().shm_name, "worker attached, waiting for tasks");

    let mut req = ReqSlot::new_boxed();
    let mut resp = RespSlot::new_boxed();

    loop {
        region.dequeue_request(&mut req)?;
        if state == WorkerState::Attached {
            transition(&mut state, WorkerState::Running);
        }

        if req.kind() == Some(TaskType::Shutdown) {
            transition(&mut state, WorkerState::Draining);
            info!("worker received shutdown sentinel");
            break;
        }

        process_one(kernel, &req, &mut resp);
        region.enqueue_response(&resp)?;
    }

    region.detach();
    transition(&mut state, WorkerState::Detached);
    Ok(())
}

/// Applies the kernel to one request and fills in the response.
fn process_one(kernel: &dyn WorkerKernel, req: &ReqSlot, resp: &mut RespSlot) {
    resp.task_id = req.task_id;
    resp.task_type = req.task_type;
    resp.status = 0;
    resp.len = 0;

    let started = Instant::now();
    let result = match req.kind() {
        Some(TaskType::TextProcess) => kernel.text(req.text_bytes(), resp.text_buf_mut()),
        Some(TaskType::AudioProcess) => {
            kernel.audio(req.sample_rate(), req.audio_samples(), resp.mel_buf_mut())
        }
        // Shutdown is intercepted by the loop; anything else is unknown.
        _ => {
            warn!(task_id = req.task_id, raw_type = req.task_type, "unknown task type");
            Err(KernelError::with_status(STATUS_UNKNOWN_TASK))
        }
    };

    match result {
        Ok(written) => resp.len = written as u32,
        Err(err) => resp.status = err.status,
    }
    resp.processing_ns = started.elapsed().as_nanos() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockKernel;

    #[test]
    fn process_fills_identity_and_payload() {
        let kernel = MockKernel::new();
        let mut req = ReqSlot::text(b"abc");
        req.task_id = 17;
        let mut resp = RespSlot::new_boxed();

        process_one(&kernel, &req, &mut resp);
        assert_eq!(resp.task_id, 17);
        assert_eq!(resp.kind(), Some(TaskType::TextProcess));
        assert!(resp.is_success());
        assert_eq!(resp.text_bytes(), b"cba");
    }

    #[test]
    fn process_flags_unknown_type() {
        let kernel = MockKernel::new();
        let mut req = ReqSlot::text(b"abc");
        req.task_type = 7; // not a TaskType
        let mut resp = RespSlot::new_boxed();

        process_one(&kernel, &req, &mut resp);
        assert_eq!(resp.status, STATUS_UNKNOWN_TASK);
        assert_eq!(resp.len, 0);
    }

    #[test]
    fn process_resets_state_between_requests() {
        let kernel = MockKernel::new();
        let mut resp = RespSlot::new_boxed();

        let mut bad = ReqSlot::text(b"x");
        bad.task_type = 7;
        process_one(&kernel, &bad, &mut resp);
        assert!(!resp.is_success());

        let good = ReqSlot::text(b"ok");
        process_one(&kernel, &good, &mut resp);
        assert!(resp.is_success());
        assert_eq!(resp.text_bytes(), b"ko");
    }
}
