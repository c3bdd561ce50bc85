//! Error types for graph capture, diffing and replay.

use thiserror::Error;

use crate::driver::NodeKind;

/// Failures raised by the capture/replay engine.
///
/// Public operations return `anyhow::Result`; callers that need to react to a
/// specific failure can `downcast_ref::<GraphError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The caller broke an API contract (wrong state, wrong stream, ...).
    #[error("graph misuse: {0}")]
    Misuse(String),

    /// A precondition of `compare_with_recapture` or `replay_dynamic` failed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The two captures handed to the diff are not structurally identical.
    #[error("captures differ structurally: {0}")]
    StructuralMismatch(String),

    #[error("unsupported graph node of kind {0:?} in a captured region")]
    UnsupportedNode(NodeKind),

    #[error("unknown graph node type {0}")]
    UnknownNodeType(u32),

    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("pointer {0:#x} was not allocated by this allocator")]
    UnknownAllocation(u64),

    /// A driver call returned non-success.
    #[error("CUDA driver error: {0}")]
    Driver(String),
}

impl GraphError {
    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }
}

#[cfg(feature = "cuda")]
impl From<candle_core::cuda::cudarc::driver::DriverError> for GraphError {
    fn from(e: candle_core::cuda::cudarc::driver::DriverError) -> Self {
        Self::Driver(e.to_string())
    }
}

/// `anyhow::ensure!` with a typed [`GraphError`] payload.
macro_rules! ensure_graph {
    ($cond:expr, $kind:ident, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::GraphError::$kind(format!($($arg)+)).into());
        }
    };
}

pub(crate) use ensure_graph;
