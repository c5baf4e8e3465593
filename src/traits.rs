//! Capability traits for the pipeline's external collaborators.
//!
//! The orchestrator never talks to a concrete document store, PDF library,
//! LLM or embedding model directly. Each is injected as an
//! `Arc<dyn Trait>` built once at startup, which keeps the core testable
//! with in-process fakes.
//!
//! ```text
//!   DocumentSource ──▶ ContentExtractor ──▶ StructuredExtractor
//!         │                                        │
//!         └──────────────▶ Pipeline ◀──────────────┘
//!                              │
//!                       EmbeddingService
//! ```

use async_trait::async_trait;

use crate::error::{ContentError, EmbedError, SourceError, StructuredError};
use crate::models::{ExtractedItem, ListKind, TenderMetadata};

/// A document as reported by a source listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDocument {
    /// Stable identifier in the source system.
    pub identity: String,
    pub name: String,
    pub path: Option<String>,
    /// Content hash, when the source can report one without a download.
    pub fingerprint: Option<String>,
    pub size_bytes: i64,
    pub modified_at: Option<i64>,
}

/// Plain text recovered from raw document bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
}

/// Lists and downloads documents from an external repository.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// List the documents currently in `container` (empty string for the root).
    async fn list(&self, container: &str) -> Result<Vec<DiscoveredDocument>, SourceError>;

    /// Download the raw bytes of one document.
    async fn fetch(&self, identity: &str) -> Result<Vec<u8>, SourceError>;
}

/// Turns raw bytes into text. `name` is a hint for format detection.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, bytes: Vec<u8>, name: &str) -> Result<ExtractedText, ContentError>;
}

/// Pulls structured tender fields out of free text.
///
/// Implementations must report unparseable upstream output as
/// [`StructuredError::Malformed`] instead of panicking.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_metadata(&self, text: &str)
        -> Result<Option<TenderMetadata>, StructuredError>;

    async fn extract_list(
        &self,
        text: &str,
        kind: ListKind,
    ) -> Result<Vec<ExtractedItem>, StructuredError>;

    /// Answer `question` using only the retrieved `context`.
    async fn answer(&self, _question: &str, _context: &str) -> Result<String, StructuredError> {
        Err(StructuredError::Disabled)
    }
}

/// Maps an ordered list of texts to vectors of the same length and order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}
