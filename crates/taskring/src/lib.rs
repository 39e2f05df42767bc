//! taskring: lock-light shared-memory task rings between processes.
//!
//! A host process and a fixed pool of worker processes communicate through
//! one named POSIX shared-memory region holding two ring buffers: an MPMC
//! request ring (many host threads → many workers) and an MPSC response
//! ring (many workers → one host drain thread). Two named counting
//! semaphores carry the "something is deliverable" signal; everything else
//! is free-running atomic indices and memcpy'd fixed-size slots.
//!
//! # Key properties
//!
//! - Slots are self-contained plain data; no pointers cross the boundary
//! - Indices are free-running u64 counters; positions are `index & mask`
//! - `QueueFull` is reported without ever losing a claimed slot
//! - A 64-byte header guards against attaching to a stale or foreign region
//!
//! # Example
//!
//! ```no_run
//! use taskring::{RegionConfig, ReqSlot, RespSlot, SharedRegion};
//!
//! // Host side
//! let region = SharedRegion::create_host(RegionConfig::default())?;
//! let mut req = ReqSlot::text(b"test message");
//! req.task_id = 1;
//! region.enqueue_request(&req)?;
//!
//! // Worker side (usually another process)
//! let worker = SharedRegion::attach_worker(RegionConfig::default())?;
//! let mut incoming = ReqSlot::new_boxed();
//! worker.dequeue_request(&mut incoming)?;
//! # Ok::<(), taskring::IpcError>(())
//! ```

mod error;
mod invariants;
mod region;
mod slots;
mod transport;

pub use error::IpcError;
pub use region::{RegionConfig, Role, SharedRegion};
pub use slots::{
    region_size, AudioPayload, Indices, RegionHeader, RegionLayout, ReqPayload, ReqSlot,
    RespPayload, RespSlot, TaskType, AUDIO_CHUNK, MAX_WORKERS, MEL_CHUNK, REGION_MAGIC,
    REGION_VERSION, RING_CAP, RING_MASK, SEM_REQ_NAME, SEM_RESP_NAME, SHM_NAME, TEXT_CHUNK,
};
