//! The compute capability a worker applies to each task.
//!
//! The transport does not care what a kernel computes; it only needs the
//! two dispatch points and a numeric failure code. The real GPU-backed mel
//! extractor is another implementation of the same trait living outside
//! this crate.

use std::thread;
use std::time::Duration;
use taskring::{MEL_CHUNK, TEXT_CHUNK};
use thiserror::Error;

/// A kernel-reported failure. The status rides back to the host in the
/// response slot; zero is reserved for success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel reported status {status}")]
pub struct KernelError {
    pub status: u32,
}

impl KernelError {
    /// A failure with the given nonzero status code.
    pub fn with_status(status: u32) -> Self {
        debug_assert_ne!(status, 0, "status 0 is reserved for success");
        Self { status }
    }
}

/// Compute capability dispatched to by the worker loop.
///
/// Implementations write into the response buffer handed to them and return
/// the count written (bytes for text, floats for audio).
pub trait WorkerKernel: Send + Sync {
    /// Transforms a text payload. `input` is at most `TEXT_CHUNK` bytes.
    fn text(&self, input: &[u8], out: &mut [u8; TEXT_CHUNK]) -> Result<usize, KernelError>;

    /// Extracts mel features from an audio payload. `samples` is at most
    /// `AUDIO_CHUNK` floats.
    fn audio(
        &self,
        sample_rate: u32,
        samples: &[f32],
        out: &mut [f32; MEL_CHUNK],
    ) -> Result<usize, KernelError>;
}

/// The reference kernel: deterministic text reversal plus a CPU mock of the
/// mel extractor. Sufficient for every transport and lifecycle test.
#[derive(Debug, Default)]
pub struct MockKernel {
    /// Optional artificial processing delay, applied to both task types.
    /// Used to model a busy GPU so queue-pressure paths can be exercised.
    delay: Option<Duration>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel that sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    fn simulate_work(&self) {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }
}

impl WorkerKernel for MockKernel {
    /// Reverses the byte string.
    fn text(&self, input: &[u8], out: &mut [u8; TEXT_CHUNK]) -> Result<usize, KernelError> {
        self.simulate_work();
        let len = input.len().min(TEXT_CHUNK);
        for (slot, byte) in out[..len].iter_mut().zip(input[..len].iter().rev()) {
            *slot = *byte;
        }
        Ok(len)
    }

    /// Writes `samples.len() / 2` floats of `0.5`, the dummy mel result
    /// the CPU mock produces in place of the CUDA kernel.
    fn audio(
        &self,
        _sample_rate: u32,
        samples: &[f32],
        out: &mut [f32; MEL_CHUNK],
    ) -> Result<usize, KernelError> {
        self.simulate_work();
        let n = (samples.len() / 2).min(MEL_CHUNK);
        out[..n].fill(0.5);
        Ok(n)
    }
}
