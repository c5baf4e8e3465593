//! Content fingerprinting and the change detector.
//!
//! [`classify`] is read-only: it looks at the ledger rows for an identity
//! and decides what a scan should do with the observed fingerprint. Races
//! between scans are settled later by the ledger write and the claim.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::error::PipelineError;
use crate::models::ProcessingStatus;

/// SHA-256 of raw document bytes, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// What a scan should do with an observed (identity, fingerprint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No version exists for this identity.
    New,
    /// This exact content already completed.
    Unchanged { version_id: String },
    /// Content differs from every recorded version; `previous` is the
    /// current latest.
    NewVersion { previous: String },
    /// This content failed before and may be retried.
    ReprocessFailed { version_id: String, retry_count: u32 },
    /// This content failed at the retry cap.
    Exhausted { version_id: String, retry_count: u32 },
    /// Recorded but never claimed.
    Pending { version_id: String },
    /// Another worker holds the claim.
    InFlight { version_id: String },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Unchanged { .. } => "unchanged",
            Classification::NewVersion { .. } => "new_version",
            Classification::ReprocessFailed { .. } => "reprocess_failed",
            Classification::Exhausted { .. } => "exhausted",
            Classification::Pending { .. } => "pending",
            Classification::InFlight { .. } => "in_flight",
        }
    }

    /// Whether the scan should hand this document to the pipeline.
    pub fn should_process(&self) -> bool {
        matches!(
            self,
            Classification::New
                | Classification::NewVersion { .. }
                | Classification::ReprocessFailed { .. }
                | Classification::Pending { .. }
        )
    }

    /// The existing version this classification refers to, if any.
    pub fn version_id(&self) -> Option<&str> {
        match self {
            Classification::Unchanged { version_id }
            | Classification::ReprocessFailed { version_id, .. }
            | Classification::Exhausted { version_id, .. }
            | Classification::Pending { version_id }
            | Classification::InFlight { version_id } => Some(version_id),
            Classification::New | Classification::NewVersion { .. } => None,
        }
    }
}

/// Snapshot of one matching version, as read from the store.
#[derive(Debug, Clone)]
pub struct VersionState {
    pub version_id: String,
    pub status: ProcessingStatus,
    pub retry_count: u32,
}

/// Pure classification rule over what the store holds for an identity.
///
/// `matching` is the version with the observed fingerprint, `latest_id` the
/// identity's current latest version.
pub fn decide(
    matching: Option<VersionState>,
    latest_id: Option<String>,
    max_retries: u32,
) -> Classification {
    match (matching, latest_id) {
        (None, None) => Classification::New,
        (None, Some(previous)) => Classification::NewVersion { previous },
        (Some(state), _) => match state.status {
            ProcessingStatus::Completed => Classification::Unchanged {
                version_id: state.version_id,
            },
            ProcessingStatus::Pending => Classification::Pending {
                version_id: state.version_id,
            },
            ProcessingStatus::Processing => Classification::InFlight {
                version_id: state.version_id,
            },
            ProcessingStatus::Failed if state.retry_count >= max_retries => {
                Classification::Exhausted {
                    version_id: state.version_id,
                    retry_count: state.retry_count,
                }
            }
            ProcessingStatus::Failed => Classification::ReprocessFailed {
                version_id: state.version_id,
                retry_count: state.retry_count,
            },
        },
    }
}

/// Classify an observed fingerprint for `identity` against the ledger.
pub async fn classify(
    pool: &SqlitePool,
    identity: &str,
    fingerprint: &str,
    max_retries: u32,
) -> Result<Classification, PipelineError> {
    let matching: Option<(String, String, i64)> = sqlx::query_as(
        "SELECT d.id, COALESCE(p.status, 'pending'), COALESCE(p.retry_count, 0) \
         FROM tracked_documents d \
         LEFT JOIN processing_records p ON p.version_id = d.id \
         WHERE d.identity = ? AND d.fingerprint = ?",
    )
    .bind(identity)
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;

    let latest_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM tracked_documents WHERE identity = ? AND is_latest = 1",
    )
    .bind(identity)
    .fetch_optional(pool)
    .await?;

    let matching = match matching {
        Some((version_id, status, retry_count)) => Some(VersionState {
            version_id,
            status: status.parse().map_err(PipelineError::Validation)?,
            retry_count: retry_count.max(0) as u32,
        }),
        None => None,
    };

    Ok(decide(matching, latest_id, max_retries))
}

/// Tender document categories, detected from the name and leading text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    Itt,
    Addendum,
    Clarification,
    Drawing,
    Specification,
    Boq,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Itt => "itt",
            DocumentType::Addendum => "addendum",
            DocumentType::Clarification => "clarification",
            DocumentType::Drawing => "drawing",
            DocumentType::Specification => "specification",
            DocumentType::Boq => "boq",
            DocumentType::Other => "other",
        }
    }
}

/// Name keywords win over content; only the first 2000 characters of text
/// are inspected.
pub fn detect_document_type(name: &str, text: &str) -> DocumentType {
    let name = name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

    if has(&["addendum", "addenda"]) {
        return DocumentType::Addendum;
    }
    if has(&["clarification"]) {
        return DocumentType::Clarification;
    }
    if has(&["drawing", "dwg"]) {
        return DocumentType::Drawing;
    }
    if has(&["specification", "spec"]) {
        return DocumentType::Specification;
    }
    if has(&["boq", "bill of quantities"]) {
        return DocumentType::Boq;
    }
    if has(&["itt", "invitation"]) {
        return DocumentType::Itt;
    }

    let head: String = text.chars().take(2000).collect::<String>().to_lowercase();
    if head.contains("invitation to tender") {
        return DocumentType::Itt;
    }

    DocumentType::Other
}
