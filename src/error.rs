//! Error taxonomy for the knowledge core.
//!
//! Errors are scoped, never process-fatal: ingestion errors fail a single
//! file, query-time errors degrade to "no knowledge context". Callers
//! decide which of those two policies applies; this module only names
//! what went wrong.

use thiserror::Error;

/// Errors raised by the knowledge core.
#[derive(Error, Debug)]
pub enum RagError {
    /// The file extension has no loader (fatal for that file only).
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// A loader recognised the format but could not read the content.
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// The embedding endpoint is unreachable, misconfigured, or returned garbage.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The persisted index is missing or corrupted.
    #[error("index load failure: {0}")]
    IndexLoadFailure(String),

    /// The index could not be mutated or persisted.
    #[error("index write failure: {0}")]
    IndexWrite(String),

    /// An LLM call failed or timed out.
    #[error("agent invocation failed: {0}")]
    AgentInvocationFailure(String),

    /// A prompt template is missing required placeholders.
    #[error("invalid prompt template: {0}")]
    Template(String),

    /// A configuration value is out of range or unknown.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Keyed storage or file registry failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::Storage(e.to_string())
    }
}

/// Result alias used across the library.
pub type RagResult<T> = Result<T, RagError>;
