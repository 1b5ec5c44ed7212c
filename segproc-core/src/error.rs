use std::sync::Arc;

use thiserror::Error;

/// The error taxonomy this crate's public API reports through.
///
/// Every fallible entry point returns one of these kinds so callers can react
/// differently to each: retry a claim, drop a package, flip to an error
/// state. Orderly shutdown is deliberately *not* a variant here — it is
/// represented as the absence of a cause (`abort(None)`) at the call sites
/// that need to distinguish it, matching the original design's "not an
/// error" treatment of shutdown.
#[derive(Debug, Error, Clone)]
pub enum ProcessorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("claim contention on segment {segment_id} for {processor_name}")]
    ClaimContention {
        processor_name: String,
        segment_id: u32,
    },

    #[error("token store transient failure: {0}")]
    StoreTransient(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    #[error("message source failure: {0}")]
    SourceFailure(String),
}

/// A captured failure, shared across every abort future waiting on the same
/// cause. Cloning an `AbortCause` is cheap; the underlying error is not
/// duplicated.
pub type AbortCause = Arc<ProcessorError>;

/// Convenience for building a `ClaimContention` without repeating field names
/// at every call site.
pub fn claim_contention(processor_name: impl Into<String>, segment_id: u32) -> ProcessorError {
    ProcessorError::ClaimContention {
        processor_name: processor_name.into(),
        segment_id,
    }
}
