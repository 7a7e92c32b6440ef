//! Engine-level error type.
//!
//! Module-local failures (allocator, transport, codec) are converted into one
//! of these five kinds at the facade boundary. Every public engine function
//! returns a `Result` carrying this type; the engine itself never panics.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Out-of-range counts, unknown parameter keys, bad shapes or offsets.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// API called before `initialize` or after `shutdown`.
    #[error("engine not initialized")]
    NotInitialized,

    /// Allocation cannot fit in any tier, even after eviction.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The underlying driver-layer operation failed.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// `free`/`access` on a handle not produced by `alloc`, or already freed.
    #[error("unknown handle {0:#x}")]
    UnknownHandle(u64),
}

pub type Result<T> = std::result::Result<T, EngineError>;
