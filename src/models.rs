//! Core data models used throughout the intake pipeline.
//!
//! These types mirror the rows the pipeline owns in SQLite: versioned
//! documents, their processing records, audit entries, and the tender
//! entities and chunks extracted from them.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One version of an externally identified document.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackedDocument {
    pub id: String,
    pub identity: String,
    pub name: String,
    pub path: Option<String>,
    pub fingerprint: String,
    pub size_bytes: i64,
    pub source_modified_at: Option<i64>,
    pub version_number: i64,
    pub is_latest: bool,
    pub previous_version_id: Option<String>,
    pub created_at: i64,
}

/// Metadata captured when a version is first recorded.
#[derive(Debug, Clone, Default)]
pub struct VersionMetadata {
    pub name: String,
    pub path: Option<String>,
    pub size_bytes: i64,
    pub source_modified_at: Option<i64>,
}

/// Stored processing state. `Exhausted` is never stored; see [`EffectiveStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

/// Status as users see it: a failed record at the retry cap is `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EffectiveStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Exhausted,
}

impl EffectiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveStatus::Pending => "pending",
            EffectiveStatus::Processing => "processing",
            EffectiveStatus::Completed => "completed",
            EffectiveStatus::Failed => "failed",
            EffectiveStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessingRecord {
    pub version_id: String,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub tender_reference: Option<String>,
    pub document_type: Option<String>,
    pub updated_at: i64,
}

impl ProcessingRecord {
    pub fn status(&self) -> ProcessingStatus {
        self.status.parse().unwrap_or(ProcessingStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
            StageOutcome::Skipped => "skipped",
        }
    }
}

/// Append-only record of one stage attempt or state transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: i64,
    pub version_id: String,
    pub stage: String,
    pub outcome: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub duration_ms: i64,
    pub detail: Option<String>,
}

/// Document-level fields returned by a structured extractor.
///
/// Every field is optional on the wire; the pipeline rejects metadata
/// without a `reference_number`. Numbers and booleans are accepted and kept
/// as their JSON text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenderMetadata {
    #[serde(alias = "tender_reference_number", deserialize_with = "scalar_string")]
    pub reference_number: Option<String>,
    #[serde(alias = "tender_title", deserialize_with = "scalar_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub issuing_authority: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub submission_deadline: Option<String>,
    #[serde(alias = "clarification_date", deserialize_with = "scalar_string")]
    pub clarification_deadline: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub site_location: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub contract_type: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub estimated_value: Option<String>,
}

fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string, number or boolean, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    QualificationCriteria,
    RequiredDocuments,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::QualificationCriteria => "qualification_criteria",
            ListKind::RequiredDocuments => "required_documents",
        }
    }
}

/// One item of an itemized list (criterion or required document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    #[serde(default = "default_category", alias = "criteria_type")]
    pub category: String,
    #[serde(alias = "criteria_description", alias = "document_name")]
    pub description: String,
    #[serde(default = "default_mandatory", alias = "is_mandatory")]
    pub mandatory: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_mandatory() -> bool {
    true
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tender {
    pub id: String,
    pub reference_number: String,
    pub title: Option<String>,
    pub issuing_authority: Option<String>,
    pub submission_deadline: Option<String>,
    pub clarification_deadline: Option<String>,
    pub site_location: Option<String>,
    pub contract_type: Option<String>,
    pub estimated_value: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A window of extracted text, before embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned from a similarity query.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub version_id: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}
