//! Crate-wide error taxonomy.
//!
//! Mirrors the failure-kind taxonomy used throughout the core: transient vs.
//! fatal is a property of the error kind, not an ad-hoc string. Storage
//! backends and factories may still use `anyhow::Error` internally (matching
//! the teacher crate's convention) but public operations on the core traits
//! return `CoreError`.

use thiserror::Error;

/// The unified error type returned by core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing embedder/store/model, invalid schema, bad config. Fatal at
    /// construction time.
    #[error("config error: {0}")]
    Config(String),

    /// I/O or 5xx from a vector store backend. Retried by callers with
    /// exponential backoff; surfaced once attempts are exhausted.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// I/O or 5xx from an LLM provider. Retried; fatal to the run once
    /// attempts are exhausted.
    #[error("transient model error: {0}")]
    TransientModel(String),

    /// Malformed embeddings, dimension mismatch, invalid metadata. Fatal per
    /// operation.
    #[error("data error: {0}")]
    Data(String),

    /// Tool argument or structured-output parse failure. Locally recovered
    /// (one repair turn, or an error tool message).
    #[error("schema error: {0}")]
    Schema(String),

    /// Input/output/tool guard refusal. Fatal for the current run.
    #[error("guardrail '{guard}' refused: {reason}")]
    Guardrail {
        /// Name of the guard that refused.
        guard: String,
        /// Human-readable refusal reason.
        reason: String,
    },

    /// The run's context was cancelled. Partial work is not committed to
    /// Learning.
    #[error("cancelled")]
    Cancelled,

    /// A per-operation deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The backend cannot perform the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An empty input was supplied where non-empty text was required.
    #[error("empty input")]
    EmptyInput,
}

impl CoreError {
    /// Whether this error kind is safe to retry (transient).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::TransientStore(_) | CoreError::TransientModel(_)
        )
    }

    /// Whether this error kind is fatal to the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_)
                | CoreError::Data(_)
                | CoreError::Guardrail { .. }
                | CoreError::Cancelled
                | CoreError::DeadlineExceeded
        )
    }
}

/// Convenience alias for fallible core operations.
pub type CoreResult<T> = Result<T, CoreError>;
