use crate::device::{CopyDirection, MemoryLocation};

/// Failures of the memory layer. Public entry points treat every variant as
/// fatal, see [`fatal`].
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("allocating {size} bytes on {location} failed: {reason}")]
    Allocation {
        size: usize,
        location: MemoryLocation,
        reason: String,
    },

    #[error("{direction} copy of {size} bytes failed: {reason}")]
    Transfer {
        size: usize,
        direction: CopyDirection,
        reason: String,
    },
}

/// Synchronous rejection of a request by the backend session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("session is closed")]
    SessionClosed,

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Per-target (or per-request) inference failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("request discarded")]
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("no value stored under tag `{0}`")]
    Missing(&'static str),

    #[error("value under tag `{tag}` is not a `{expected}`")]
    TypeMismatch {
        tag: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("submission failed: {0}")]
    Submission(#[from] SubmitError),

    #[error(transparent)]
    Collection(#[from] CollectionError),
}

/// Memory-layer failures must never leave partially written frame data or
/// half-counted stream state behind, so they end the process. Unwinding is
/// not an option, tokio tasks would catch it.
#[track_caller]
pub(crate) fn fatal(err: MemoryError) -> ! {
    log::error!("fatal memory error at {}: {:#}", std::panic::Location::caller(), err);
    std::process::abort()
}
