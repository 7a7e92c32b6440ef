//! Transport: the opaque channel to the driver and its home agent.
//!
//! The engine never talks to hardware directly. Everything it needs from the
//! device side is expressed as five operations (DMA batches, speculative
//! prefetch submissions, completion polling, parameter writes, and coherence
//! requests) behind the [`Transport`] trait. Tests run against
//! [`MockTransport`]; a production build would wrap the character-device
//! driver here.

pub mod mock;

use thiserror::Error;

pub use mock::MockTransport;

/// Maximum descriptors accepted by a single DMA batch submission.
pub const MAX_DMA_BATCH: usize = 4096;

/// Descriptor flag: transfer is a write (device-bound).
pub const DMA_FLAG_WRITE: u32 = 1 << 0;
/// Descriptor flag: payload is compressed.
pub const DMA_FLAG_COMPRESSED: u32 = 1 << 1;
/// Descriptor flag: transfer is speculative.
pub const DMA_FLAG_PREFETCH: u32 = 1 << 2;

/// Parameter key: speculative prefetch depth.
pub const PARAM_PREFETCH_DEPTH: u32 = 1;
/// Parameter key: compression scheme (see [`CompressionScheme`]).
pub const PARAM_COMPRESSION_SCHEME: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("DMA batch of {0} descriptors exceeds limit of {MAX_DMA_BATCH}")]
    BatchTooLarge(usize),

    #[error("unknown parameter key {0}")]
    UnknownParameter(u32),

    #[error("device rejected {op}: {reason}")]
    DeviceError { op: &'static str, reason: String },

    #[error("device unavailable")]
    Unavailable,
}

/// A single DMA transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Far-memory side address.
    pub fpga_addr: u64,

    /// Device-local side address.
    pub gpu_addr: u64,

    /// Transfer size in bytes.
    pub bytes: u32,

    /// DMA_FLAG_* bits.
    pub flags: u32,
}

/// Header of a speculative prefetch submission. The token history travels
/// alongside as a separate slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchCommand {
    /// Caller-assigned request id.
    pub req_id: u32,

    /// Model layer the fetched pages belong to.
    pub layer: u16,

    /// Current token position in the sequence.
    pub cur_pos: u32,

    /// Number of speculative candidates requested.
    pub depth_k: u32,
}

/// Coherence operation codes, as understood by the home agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CoherenceOp {
    Read = 0,
    Write = 1,
    Invalidate = 2,
    Writeback = 3,
    Flush = 4,
}

/// Compression schemes selectable via `set_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionScheme {
    Fp16 = 0,
    Int8 = 1,
    Int8DeltaRle = 2,
}

/// The five driver-level operations the engine consumes.
///
/// Implementations must be safe to call from multiple threads; calls may
/// block for bounded time but there is no cancellation primitive. Failures
/// are reported through the `Result`; the engine never retries internally.
pub trait Transport: Send + Sync {
    /// Submit a batch of DMA descriptors. At most [`MAX_DMA_BATCH`] entries.
    fn submit_dma_batch(&self, descriptors: &[DmaDescriptor]) -> Result<(), TransportError>;

    /// Submit a speculative prefetch request with its token history.
    fn submit_prefetch(
        &self,
        request: &PrefetchCommand,
        tokens: &[i32],
    ) -> Result<(), TransportError>;

    /// Read-and-clear the device completion counter.
    fn poll_completion(&self) -> Result<u32, TransportError>;

    /// Write a device parameter. Unknown keys are rejected.
    fn set_parameter(&self, key: u32, value: u32) -> Result<(), TransportError>;

    /// Issue a coherence operation for a cache-line-aligned address.
    /// `data` carries the line payload for writes and writebacks.
    fn coherence_request(
        &self,
        op: CoherenceOp,
        addr: u64,
        data: Option<&[u8]>,
    ) -> Result<(), TransportError>;

    /// Block until the previously issued coherence operation has completed.
    fn coherence_wait_complete(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_are_distinct() {
        assert_eq!(DMA_FLAG_WRITE & DMA_FLAG_COMPRESSED, 0);
        assert_eq!(DMA_FLAG_COMPRESSED & DMA_FLAG_PREFETCH, 0);
    }

    #[test]
    fn test_coherence_op_codes() {
        assert_eq!(CoherenceOp::Read as u32, 0);
        assert_eq!(CoherenceOp::Flush as u32, 4);
    }
}
