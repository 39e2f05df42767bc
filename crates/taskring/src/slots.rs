//! Binary layout of the shared region: slots, indices, and the header guard.
//!
//! Everything in this module is mapped verbatim into every participating
//! process, so the rules are strict: `#[repr(C)]`, natural alignment, fixed
//! sizes, no pointers, no heap references. A slot crosses the process
//! boundary as a plain memcpy.
//!
//! # Memory Layout
//!
//! Header fits in one cache line (64 bytes) so it never shares a line with
//! the hot indices.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic │ version │ ring_cap │ req_slot_size │ resp_slot_size  │ (64 B)
//! ├──────────────────────────────────────────────────────────────┤
//! │ req_write_idx │ req_read_idx │ resp_write_idx │ resp_read_idx│ (32 B)
//! ├──────────────────────────────────────────────────────────────┤
//! │                    req_ring[0..RING_CAP]                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    resp_ring[0..RING_CAP]                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::mem::size_of;
use std::sync::atomic::AtomicU64;

/// Number of slots per ring. Power of two so `index & RING_MASK` replaces
/// the modulo.
pub const RING_CAP: usize = 256;

/// Bitmask for mapping a free-running index onto a ring position.
pub const RING_MASK: u64 = (RING_CAP as u64) - 1;

/// Maximum bytes of text carried by one request or response.
pub const TEXT_CHUNK: usize = 4096;

/// Maximum audio samples per request. Whisper-style 16 kHz input, so one
/// chunk holds a second of audio (16000 × 4 bytes = 64 KiB).
pub const AUDIO_CHUNK: usize = 16000;

/// Maximum mel features per response: 80 mel bins × 100 frames for a
/// one-second chunk at hop length 160.
pub const MEL_CHUNK: usize = 8000;

/// Upper bound on the worker pool size.
pub const MAX_WORKERS: usize = 8;

/// Default name of the POSIX shared-memory object.
pub const SHM_NAME: &str = "/oatpp_whisper_shm";

/// Default name of the request-counting semaphore.
pub const SEM_REQ_NAME: &str = "/oatpp_whisper_sem_req";

/// Default name of the response-counting semaphore.
pub const SEM_RESP_NAME: &str = "/oatpp_whisper_sem_resp";

/// Magic number at offset zero of every region.
///
/// ASCII encoding of "TASKRING": `0x5441_534B_5249_4E47`. A worker that maps
/// a region without this magic is looking at something else entirely and
/// must not touch the indices.
pub const REGION_MAGIC: u64 = 0x5441_534B_5249_4E47;

/// Current region format version. Incremented on any incompatible layout
/// change; mixing versions across processes is rejected at attach.
pub const REGION_VERSION: u32 = 1;

const _: () = assert!(RING_CAP.is_power_of_two());

/// Task discriminator carried in the `task_type` field of both slot kinds.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Deterministic text transform.
    TextProcess = 0,
    /// Audio-to-mel feature extraction.
    AudioProcess = 1,
    /// Sentinel that terminates one worker loop (or the host drain loop).
    Shutdown = 99,
}

impl TaskType {
    /// Decodes the raw wire value. Unknown values map to `None`; the worker
    /// answers those with a nonzero status instead of crashing.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TaskType::TextProcess),
            1 => Some(TaskType::AudioProcess),
            99 => Some(TaskType::Shutdown),
            _ => None,
        }
    }
}

/// Audio arm of the request payload union.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioPayload {
    pub sample_rate: u32,
    pub num_samples: u32,
    pub samples: [f32; AUDIO_CHUNK],
}

/// Request payload. Which arm is live is decided by `ReqSlot::task_type`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ReqPayload {
    pub text: [u8; TEXT_CHUNK],
    pub audio: AudioPayload,
}

/// One request ring slot. Written once by a host producer, read once by a
/// worker consumer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReqSlot {
    /// Monotonic id assigned at submit; the sole correlation key.
    pub task_id: u64,
    /// Raw `TaskType` discriminator.
    pub task_type: u32,
    /// Live byte (text) or unused (audio; see `AudioPayload::num_samples`).
    pub len: u32,
    /// UNIX-epoch nanoseconds at enqueue, for latency tracking.
    pub enqueue_ts_ns: u64,
    pub payload: ReqPayload,
}

impl ReqSlot {
    /// Heap-allocates a zeroed slot. The all-zero pattern is a valid
    /// `TextProcess` request of length 0.
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: every field of ReqSlot (including both union arms) is
        // plain old data for which the all-zero bit pattern is valid.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }

    /// Builds a text request. Input beyond `TEXT_CHUNK` bytes is truncated.
    pub fn text(input: &[u8]) -> Box<Self> {
        let mut slot = Self::new_boxed();
        slot.task_type = TaskType::TextProcess as u32;
        let len = input.len().min(TEXT_CHUNK);
        // SAFETY: writing the text arm of the union; the slot was zeroed.
        unsafe {
            slot.payload.text[..len].copy_from_slice(&input[..len]);
        }
        slot.len = len as u32;
        slot
    }

    /// Builds an audio request. Samples beyond `AUDIO_CHUNK` are truncated.
    pub fn audio(sample_rate: u32, samples: &[f32]) -> Box<Self> {
        let mut slot = Self::new_boxed();
        slot.task_type = TaskType::AudioProcess as u32;
        let n = samples.len().min(AUDIO_CHUNK);
        // SAFETY: writing the audio arm of the union; the slot was zeroed.
        unsafe {
            slot.payload.audio.sample_rate = sample_rate;
            slot.payload.audio.num_samples = n as u32;
            slot.payload.audio.samples[..n].copy_from_slice(&samples[..n]);
        }
        slot.len = n as u32;
        slot
    }

    /// Builds the shutdown sentinel. `task_id` stays 0; real ids start at 1.
    pub fn shutdown() -> Box<Self> {
        let mut slot = Self::new_boxed();
        slot.task_type = TaskType::Shutdown as u32;
        slot
    }

    /// Decoded task type, or `None` for an unknown wire value.
    #[inline]
    pub fn kind(&self) -> Option<TaskType> {
        TaskType::from_raw(self.task_type)
    }

    /// The live bytes of the text arm, clamped by `len`.
    pub fn text_bytes(&self) -> &[u8] {
        let len = (self.len as usize).min(TEXT_CHUNK);
        // SAFETY: the text arm is a byte array; every bit pattern is valid
        // and the slice is clamped to the chunk size.
        unsafe { &self.payload.text[..len] }
    }

    /// Sample rate of the audio arm.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        // SAFETY: u32 accepts every bit pattern.
        unsafe { self.payload.audio.sample_rate }
    }

    /// The live samples of the audio arm, clamped by `num_samples`.
    pub fn audio_samples(&self) -> &[f32] {
        // SAFETY: f32 accepts every bit pattern; the count is clamped to the
        // chunk size.
        unsafe {
            let n = (self.payload.audio.num_samples as usize).min(AUDIO_CHUNK);
            &self.payload.audio.samples[..n]
        }
    }
}

/// Response payload. Which arm is live is decided by `RespSlot::task_type`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RespPayload {
    pub text: [u8; TEXT_CHUNK],
    pub mel: [f32; MEL_CHUNK],
}

/// One response ring slot. Written once by a worker, read once by the host
/// drain thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespSlot {
    pub task_id: u64,
    pub task_type: u32,
    /// Live bytes (text) or live floats (mel).
    pub len: u32,
    /// 0 = success; nonzero is a kernel-reported failure code.
    pub status: u32,
    /// Worker-side processing time in nanoseconds.
    pub processing_ns: u64,
    pub payload: RespPayload,
}

impl RespSlot {
    /// Heap-allocates a zeroed slot.
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: as for ReqSlot, the all-zero pattern is valid.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }

    /// Starts a response for `req`: same task id and type, status 0.
    pub fn reply_to(req: &ReqSlot) -> Box<Self> {
        let mut slot = Self::new_boxed();
        slot.task_id = req.task_id;
        slot.task_type = req.task_type;
        slot
    }

    /// Decoded task type, or `None` for an unknown wire value.
    #[inline]
    pub fn kind(&self) -> Option<TaskType> {
        TaskType::from_raw(self.task_type)
    }

    /// True when the kernel reported success.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// The live bytes of the text arm, clamped by `len`.
    pub fn text_bytes(&self) -> &[u8] {
        let len = (self.len as usize).min(TEXT_CHUNK);
        // SAFETY: byte array arm, clamped.
        unsafe { &self.payload.text[..len] }
    }

    /// The live floats of the mel arm, clamped by `len`.
    pub fn mel_features(&self) -> &[f32] {
        let len = (self.len as usize).min(MEL_CHUNK);
        // SAFETY: f32 array arm, clamped.
        unsafe { &self.payload.mel[..len] }
    }

    /// Whole text buffer for a kernel to write into. The caller sets `len`
    /// to the count actually written.
    pub fn text_buf_mut(&mut self) -> &mut [u8; TEXT_CHUNK] {
        // SAFETY: unique borrow of the union; the text arm accepts every
        // bit pattern.
        unsafe { &mut self.payload.text }
    }

    /// Whole mel buffer for a kernel to write into.
    pub fn mel_buf_mut(&mut self) -> &mut [f32; MEL_CHUNK] {
        // SAFETY: unique borrow of the union; the mel arm accepts every
        // bit pattern.
        unsafe { &mut self.payload.mel }
    }
}

/// Header at offset zero of the region.
///
/// Written once by the host before any worker attaches; read-only
/// afterwards. Guards against attaching to a stale or foreign mapping and
/// against host/worker binaries built from diverging layouts.
#[repr(C)]
pub struct RegionHeader {
    pub magic: u64,
    pub version: u32,
    _reserved: u32,
    pub ring_cap: u64,
    pub req_slot_size: u64,
    pub resp_slot_size: u64,
    /// Padding to the end of the first cache line.
    _pad: [u8; 24],
}

const _: () = assert!(size_of::<RegionHeader>() == 64);

impl RegionHeader {
    /// Header describing the layout this binary was compiled against.
    pub fn current() -> Self {
        Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            _reserved: 0,
            ring_cap: RING_CAP as u64,
            req_slot_size: size_of::<ReqSlot>() as u64,
            resp_slot_size: size_of::<RespSlot>() as u64,
            _pad: [0; 24],
        }
    }

    /// Validates a mapped header against this binary's layout.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != REGION_MAGIC {
            return Err("bad magic");
        }
        if self.version != REGION_VERSION {
            return Err("version mismatch");
        }
        if self.ring_cap != RING_CAP as u64 {
            return Err("ring capacity mismatch");
        }
        if self.req_slot_size != size_of::<ReqSlot>() as u64 {
            return Err("request slot size mismatch");
        }
        if self.resp_slot_size != size_of::<RespSlot>() as u64 {
            return Err("response slot size mismatch");
        }
        Ok(())
    }
}

/// The four free-running ring indices. Constructed in place by the host
/// only; workers must never reinitialize them.
#[repr(C)]
pub struct Indices {
    pub req_write_idx: AtomicU64,
    pub req_read_idx: AtomicU64,
    pub resp_write_idx: AtomicU64,
    pub resp_read_idx: AtomicU64,
}

impl Indices {
    pub fn zeroed() -> Self {
        Self {
            req_write_idx: AtomicU64::new(0),
            req_read_idx: AtomicU64::new(0),
            resp_write_idx: AtomicU64::new(0),
            resp_read_idx: AtomicU64::new(0),
        }
    }
}

/// The full mapped region. Never constructed by value (roughly 25 MiB),
/// only projected through the mapping pointer.
#[repr(C)]
pub struct RegionLayout {
    pub header: RegionHeader,
    pub indices: Indices,
    pub req_ring: [ReqSlot; RING_CAP],
    pub resp_ring: [RespSlot; RING_CAP],
}

/// Total bytes the shared-memory object is sized to.
pub fn region_size() -> usize {
    size_of::<RegionLayout>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_cache_line() {
        assert_eq!(size_of::<RegionHeader>(), 64);
        assert_eq!(size_of::<Indices>(), 32);
    }

    #[test]
    fn header_round_trip_validates() {
        let header = RegionHeader::current();
        assert!(header.validate().is_ok());
    }

    #[test]
    fn header_rejects_foreign_magic() {
        let mut header = RegionHeader::current();
        header.magic = 0xDEAD_BEEF;
        assert_eq!(header.validate(), Err("bad magic"));

        let mut header = RegionHeader::current();
        header.version = REGION_VERSION + 1;
        assert_eq!(header.validate(), Err("version mismatch"));
    }

    #[test]
    fn task_type_raw_round_trip() {
        assert_eq!(TaskType::from_raw(0), Some(TaskType::TextProcess));
        assert_eq!(TaskType::from_raw(1), Some(TaskType::AudioProcess));
        assert_eq!(TaskType::from_raw(99), Some(TaskType::Shutdown));
        assert_eq!(TaskType::from_raw(2), None);
        assert_eq!(TaskType::from_raw(400), None);
    }

    #[test]
    fn text_request_clamps_to_chunk() {
        let big = vec![b'x'; TEXT_CHUNK + 100];
        let slot = ReqSlot::text(&big);
        assert_eq!(slot.len as usize, TEXT_CHUNK);
        assert_eq!(slot.text_bytes().len(), TEXT_CHUNK);
        assert_eq!(slot.kind(), Some(TaskType::TextProcess));
    }

    #[test]
    fn audio_request_carries_samples() {
        let samples = vec![0.25f32; 401];
        let slot = ReqSlot::audio(16000, &samples);
        assert_eq!(slot.sample_rate(), 16000);
        assert_eq!(slot.audio_samples().len(), 401);
        assert!(slot.audio_samples().iter().all(|&s| s == 0.25));
    }

    #[test]
    fn response_reply_copies_identity() {
        let req = ReqSlot::text(b"hello");
        let resp = RespSlot::reply_to(&req);
        assert_eq!(resp.task_id, req.task_id);
        assert_eq!(resp.task_type, req.task_type);
        assert!(resp.is_success());
    }

    #[test]
    fn zeroed_slots_decode_safely() {
        let req = ReqSlot::new_boxed();
        assert_eq!(req.kind(), Some(TaskType::TextProcess));
        assert_eq!(req.text_bytes(), b"");

        let resp = RespSlot::new_boxed();
        assert!(resp.is_success());
        assert_eq!(resp.mel_features(), &[] as &[f32]);
    }
}
