//! The enqueue/dequeue discipline for both rings.
//!
//! =========================================================================
//! MEMORY ORDERING & SYNCHRONIZATION STRATEGY
//! =========================================================================
//!
//! Both rings use free-running u64 indices that are never reset; a slot
//! position is `index & RING_MASK`. With 2^64 values, wrap-around of the
//! counters themselves is unreachable in practice, so `write - read` is
//! always the exact in-flight count.
//!
//! ## Request ring (MPMC: host producer threads → worker processes)
//!
//! **Producer (any host thread):**
//! 1. Load `req_write_idx` (Relaxed) and `req_read_idx` (Acquire)
//! 2. If `write - read >= RING_CAP`: full, report `QueueFull`. No index was
//!    moved, so no slot is ever lost to a rolled-back claim
//! 3. CAS `req_write_idx` from `write` to `write + 1` (AcqRel); on contention
//!    reload and re-check capacity
//! 4. Copy the slot body into `req_ring[write & MASK]`
//! 5. Release fence, then `sem_post(sem_req)`. The post makes the slot
//!    deliverable; the fence makes its body visible before that
//!
//! **Consumer (any worker process):**
//! 1. `sem_wait(sem_req)`, one wakeup per deliverable slot
//! 2. `fetch_add(req_read_idx, 1, AcqRel)` claims a unique read position
//! 3. Acquire fence, then copy the slot body out
//!
//! ## Response ring (MPSC: worker processes → host drain thread)
//!
//! Producers claim with `fetch_add` and never check for overflow: the host
//! drains in lock-step with submissions, so outstanding responses are
//! bounded by outstanding requests, which the request ring caps at
//! `RING_CAP`. The single consumer advances `resp_read_idx` with a plain
//! load/store pair (it is the only writer of that index).
//!
//! A semaphore post/wait alone is not relied on to order the slot-body
//! writes across processes; the explicit release/acquire fences are what
//! pair the producer's copy with the consumer's.
//!
//! ## Ordering guarantees
//!
//! Claimed read positions follow claimed write positions in the same total
//! order, so the transport is FIFO at the token level. Completion order is
//! not FIFO (workers process concurrently), which is why correlation is by
//! `task_id` only.
//! =========================================================================

use crate::error::IpcError;
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_monotonic, debug_assert_read_behind_write,
};
use crate::region::SharedRegion;
use crate::slots::{ReqSlot, RespSlot, RING_CAP};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

impl SharedRegion {
    /// Enqueues a request for any worker to pick up.
    ///
    /// Fails with [`IpcError::QueueFull`] when the ring is saturated; the
    /// caller retries or rejects. Never blocks.
    pub fn enqueue_request(&self, req: &ReqSlot) -> Result<(), IpcError> {
        let idx = self.indices();

        let mut write = idx.req_write_idx.load(Ordering::Relaxed);
        loop {
            let read = idx.req_read_idx.load(Ordering::Acquire);
            if write.wrapping_sub(read) >= RING_CAP as u64 {
                return Err(IpcError::QueueFull);
            }
            match idx.req_write_idx.compare_exchange_weak(
                write,
                write + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    debug_assert_bounded_count!(
                        (write + 1).wrapping_sub(read) as usize,
                        RING_CAP
                    );
                    break;
                }
                Err(current) => {
                    debug_assert_monotonic!("req_write_idx", write, current);
                    write = current;
                }
            }
        }

        // SAFETY: the CAS handed this producer exclusive ownership of the
        // slot at `write`; no consumer reads it before the matching
        // sem_post, and no other producer can claim the same index.
        unsafe {
            ptr::copy_nonoverlapping(req, self.req_slot(write), 1);
        }

        // Publish the body before the slot becomes deliverable.
        fence(Ordering::Release);
        self.sem_req.post();
        Ok(())
    }

    /// Blocks until a request is deliverable, then copies it out.
    ///
    /// Many workers may call this concurrently; each wakeup claims a unique
    /// read position. Signal-interrupted waits are retried.
    pub fn dequeue_request(&self, out: &mut ReqSlot) -> Result<(), IpcError> {
        self.sem_req.wait()?;

        let idx = self.indices();
        let read = idx.req_read_idx.fetch_add(1, Ordering::AcqRel);
        debug_assert_read_behind_write!(
            read + 1,
            idx.req_write_idx.load(Ordering::Relaxed)
        );

        // Pair with the producer's release fence.
        fence(Ordering::Acquire);
        // SAFETY: the semaphore count guarantees a deliverable slot exists
        // and the fetch_add gave this consumer a unique position for it.
        unsafe {
            ptr::copy_nonoverlapping(self.req_slot(read).cast_const(), out, 1);
        }
        Ok(())
    }

    /// Enqueues a response. Called by workers (and by the host once, to wake
    /// its own drain thread with the shutdown sentinel).
    ///
    /// Overflow is not checked: outstanding responses are bounded by
    /// outstanding requests, which the request ring caps.
    pub fn enqueue_response(&self, resp: &RespSlot) -> Result<(), IpcError> {
        let idx = self.indices();
        let write = idx.resp_write_idx.fetch_add(1, Ordering::AcqRel);
        debug_assert_bounded_count!(
            (write + 1).wrapping_sub(idx.resp_read_idx.load(Ordering::Relaxed)) as usize,
            RING_CAP
        );

        // SAFETY: the fetch_add handed this producer a unique slot; the
        // single consumer does not read it before the matching sem_post.
        unsafe {
            ptr::copy_nonoverlapping(resp, self.resp_slot(write), 1);
        }

        fence(Ordering::Release);
        self.sem_resp.post();
        Ok(())
    }

    /// Blocks until a response is deliverable, then copies it out.
    ///
    /// Single-consumer: only the host drain thread may call this.
    pub fn dequeue_response(&self, out: &mut RespSlot) -> Result<(), IpcError> {
        self.sem_resp.wait()?;
        self.take_response(out);
        Ok(())
    }

    /// Non-blocking variant of [`SharedRegion::dequeue_response`]. Returns
    /// `Ok(false)` when nothing is deliverable.
    pub fn try_dequeue_response(&self, out: &mut RespSlot) -> Result<bool, IpcError> {
        if !self.sem_resp.try_wait()? {
            return Ok(false);
        }
        self.take_response(out);
        Ok(true)
    }

    fn take_response(&self, out: &mut RespSlot) {
        let idx = self.indices();

        // Pair with the worker's release fence.
        fence(Ordering::Acquire);
        let read = idx.resp_read_idx.load(Ordering::Relaxed);
        debug_assert_read_behind_write!(
            read + 1,
            idx.resp_write_idx.load(Ordering::Relaxed)
        );
        // SAFETY: the semaphore count guarantees the slot at `read` is
        // deliverable, and this thread is the index's only writer.
        unsafe {
            ptr::copy_nonoverlapping(self.resp_slot(read).cast_const(), out, 1);
        }
        idx.resp_read_idx.store(read + 1, Ordering::Release);
    }

    /// Requests enqueued but not yet claimed by a worker.
    pub fn pending_requests(&self) -> usize {
        let idx = self.indices();
        idx.req_write_idx
            .load(Ordering::Relaxed)
            .wrapping_sub(idx.req_read_idx.load(Ordering::Relaxed)) as usize
    }

    /// Responses enqueued but not yet drained by the host.
    pub fn pending_responses(&self) -> usize {
        let idx = self.indices();
        idx.resp_write_idx
            .load(Ordering::Relaxed)
            .wrapping_sub(idx.resp_read_idx.load(Ordering::Relaxed)) as usize
    }
}
