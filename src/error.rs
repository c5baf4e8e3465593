//! Error taxonomy for the ingestion pipeline.
//!
//! Collaborators (document source, extractors, embedding service) report
//! their own typed errors. Each converts into a [`PipelineError`], whose
//! variant decides how the failure is treated:
//!
//! | Variant | Meaning | Auto-retry |
//! |---------|---------|------------|
//! | `TransientIo` | network or service hiccup | yes |
//! | `Timeout` | a stage exceeded its time budget | yes |
//! | `Interrupted` | shutdown requested between stages | yes |
//! | `Validation` | an extractor returned unusable data | yes |
//! | `Conflict` | ledger race; caller re-classifies | n/a |
//! | `Superseded` | a newer version appeared mid-run | no |
//! | `ExhaustedRetries` | retry cap reached | no |
//! | `Store` | durable store failure | yes |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("stage '{stage}' timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    #[error("interrupted by shutdown before stage '{stage}'")]
    Interrupted { stage: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version conflict for '{identity}': {detail}")]
    Conflict { identity: String, detail: String },

    #[error("version {version_id} was superseded by a newer version")]
    Superseded { version_id: String },

    #[error("retries exhausted for version {version_id} ({retry_count} attempts)")]
    ExhaustedRetries { version_id: String, retry_count: u32 },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// Whether a version failing with this error stays eligible for an
    /// automatic retry once its backoff window elapses. A non-retryable
    /// failure exhausts the version immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::ExhaustedRetries { .. }
                | PipelineError::Conflict { .. }
                | PipelineError::Superseded { .. }
        )
    }

    /// Short machine-readable label, recorded in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientIo(_) => "transient_io",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Interrupted { .. } => "interrupted",
            PipelineError::Validation(_) => "validation",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::Superseded { .. } => "superseded",
            PipelineError::ExhaustedRetries { .. } => "exhausted_retries",
            PipelineError::Store(_) => "store",
        }
    }
}

/// Errors raised by a [`DocumentSource`](crate::traits::DocumentSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("document not found in source: {0}")]
    NotFound(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Only transient failures are retried inside the fetch stage.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::NotFound(_) => false,
            SourceError::Unavailable(_) => true,
            SourceError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        if e.is_transient() {
            PipelineError::TransientIo(e.to_string())
        } else {
            PipelineError::Validation(e.to_string())
        }
    }
}

/// Errors raised by a [`ContentExtractor`](crate::traits::ContentExtractor).
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("unsupported content: {0}")]
    Unsupported(String),
    #[error("corrupt or unreadable document: {0}")]
    Corrupt(String),
}

impl From<ContentError> for PipelineError {
    fn from(e: ContentError) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

/// Errors raised by a [`StructuredExtractor`](crate::traits::StructuredExtractor).
#[derive(Debug, Error)]
pub enum StructuredError {
    #[error("extraction service request failed: {0}")]
    Transport(String),
    #[error("malformed extraction response: {0}")]
    Malformed(String),
    #[error("extraction disabled")]
    Disabled,
}

impl From<StructuredError> for PipelineError {
    fn from(e: StructuredError) -> Self {
        match e {
            StructuredError::Transport(msg) => PipelineError::TransientIo(msg),
            other => PipelineError::Validation(other.to_string()),
        }
    }
}

/// Errors raised by an [`EmbeddingService`](crate::traits::EmbeddingService).
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Transport(String),
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    #[error("embedding service returned {got} vectors for {expected} texts")]
    LengthMismatch { expected: usize, got: usize },
}

impl From<EmbedError> for PipelineError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Transport(msg) => PipelineError::TransientIo(msg),
            other => PipelineError::Validation(other.to_string()),
        }
    }
}
