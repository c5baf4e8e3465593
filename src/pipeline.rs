//! Pipeline orchestrator.
//!
//! [`Pipeline::run`] claims a version and drives it through five stages:
//! fetch, extract text, extract structured fields, persist entities, and
//! chunk & embed. Each stage runs under a timeout and leaves exactly one
//! audit entry. The first failing stage short-circuits the rest and the
//! version is marked failed; the shutdown token is checked between stages
//! so a run stops at a stage boundary, never mid-write. A run whose version
//! was superseded while it ran stops before writing any entities.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{self, stage, NewAuditEntry};
use crate::chunk::chunk_words;
use crate::config::{ChunkingConfig, Config, ProcessingConfig};
use crate::detect::{detect_document_type, fingerprint};
use crate::error::{EmbedError, PipelineError};
use crate::ledger;
use crate::models::{ExtractedItem, ListKind, StageOutcome, TenderMetadata, TrackedDocument};
use crate::state::{self, ClaimOutcome, RetryPolicy};
use crate::store;
use crate::traits::{ContentExtractor, DocumentSource, EmbeddingService, StructuredExtractor};

/// Injected collaborators, built once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn DocumentSource>,
    pub content: Arc<dyn ContentExtractor>,
    pub structured: Arc<dyn StructuredExtractor>,
    pub embedder: Arc<dyn EmbeddingService>,
}

/// How one `run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        tender_reference: String,
        chunks: usize,
    },
    Failed {
        error: String,
        retry_count: u32,
        exhausted: bool,
    },
    /// The claim was refused; nothing ran.
    NotClaimed(ClaimOutcome),
}

struct Structured {
    reference: String,
    metadata: TenderMetadata,
    criteria: Vec<ExtractedItem>,
    documents: Vec<ExtractedItem>,
}

#[derive(Clone)]
pub struct Pipeline {
    pool: SqlitePool,
    collab: Collaborators,
    processing: ProcessingConfig,
    chunking: ChunkingConfig,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        collab: Collaborators,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            collab,
            processing: config.processing.clone(),
            chunking: config.chunking.clone(),
            shutdown,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.collab.source
    }

    pub fn processing(&self) -> &ProcessingConfig {
        &self.processing
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.processing.max_retries,
            retry_delay_secs: self.processing.retry_delay_secs,
        }
    }

    /// Longest a claimed run can legitimately take.
    pub fn max_run_secs(&self) -> u64 {
        self.processing.stage_timeout_secs * stage::PIPELINE.len() as u64
    }

    /// Claim `version_id` and run every stage. Errors are only returned when
    /// the outcome itself cannot be recorded.
    pub async fn run(&self, version_id: &str) -> Result<RunOutcome, PipelineError> {
        let claim = state::claim(&self.pool, version_id, &self.retry_policy()).await?;
        if claim != ClaimOutcome::Claimed {
            debug!(version_id, ?claim, "not claimed");
            return Ok(RunOutcome::NotClaimed(claim));
        }

        let doc = match ledger::get_version(&self.pool, version_id).await? {
            Some(doc) => doc,
            None => {
                let err = PipelineError::Validation(format!("version {} vanished", version_id));
                return self.fail(version_id, err).await;
            }
        };

        info!(version_id, identity = %doc.identity, version = doc.version_number, "processing");
        match self.execute(&doc).await {
            Ok((reference, document_type, chunks)) => {
                state::mark_completed(&self.pool, version_id, &reference, &document_type).await?;
                Ok(RunOutcome::Completed {
                    tender_reference: reference,
                    chunks,
                })
            }
            Err(e) => self.fail(version_id, e).await,
        }
    }

    async fn fail(&self, version_id: &str, err: PipelineError) -> Result<RunOutcome, PipelineError> {
        let max = self.processing.max_retries;
        let retry_count = state::mark_failed(&self.pool, version_id, &err, max).await?;
        Ok(RunOutcome::Failed {
            error: err.to_string(),
            retry_count,
            exhausted: retry_count >= max,
        })
    }

    async fn execute(
        &self,
        doc: &TrackedDocument,
    ) -> Result<(String, String, usize), PipelineError> {
        let vid = doc.id.as_str();

        let bytes = self
            .run_stage(vid, stage::FETCH, self.fetch_stage(doc))
            .await?;

        let text = self
            .run_stage(vid, stage::EXTRACT_TEXT, self.extract_text_stage(doc, bytes))
            .await?;
        let document_type = detect_document_type(&doc.name, &text).as_str().to_string();

        let structured = self
            .run_stage(vid, stage::EXTRACT_STRUCTURED, self.structured_stage(&text))
            .await?;

        let persisted = self
            .run_stage(vid, stage::PERSIST, self.persist_stage(vid, &structured))
            .await?;

        let chunks = self
            .run_stage(
                vid,
                stage::CHUNK_EMBED,
                self.chunk_embed_stage(vid, &persisted.tender_id, &text),
            )
            .await?;

        Ok((persisted.reference_number, document_type, chunks))
    }

    /// Run one stage under the stage timeout and audit its outcome. The
    /// future yields the stage value plus a one-line summary.
    async fn run_stage<T, F>(
        &self,
        version_id: &str,
        name: &'static str,
        fut: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<(T, String), PipelineError>>,
    {
        if self.shutdown.is_cancelled() {
            let err = PipelineError::Interrupted {
                stage: name.to_string(),
            };
            audit::append(
                &self.pool,
                &NewAuditEntry::event(version_id, name, StageOutcome::Skipped, Some(err.to_string())),
            )
            .await?;
            return Err(err);
        }

        let started_at_ms = audit::now_ms();
        let result = match tokio::time::timeout(self.processing.stage_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                stage: name.to_string(),
                secs: self.processing.stage_timeout_secs,
            }),
        };

        let (outcome, detail) = match &result {
            Ok((_, summary)) => (StageOutcome::Succeeded, summary.clone()),
            Err(e) => (StageOutcome::Failed, format!("[{}] {}", e.kind(), e)),
        };
        audit::append(
            &self.pool,
            &NewAuditEntry {
                version_id,
                stage: name,
                outcome,
                started_at_ms,
                finished_at_ms: audit::now_ms(),
                detail: Some(detail.clone()),
            },
        )
        .await?;

        match result {
            Ok((value, _)) => {
                debug!(version_id, stage = name, detail = %detail, "stage succeeded");
                Ok(value)
            }
            Err(e) => {
                warn!(version_id, stage = name, error = %e, "stage failed");
                Err(e)
            }
        }
    }

    /// Download `identity`, retrying transient source errors with
    /// exponential backoff. Returns the bytes and the attempts used.
    pub async fn fetch_document(&self, identity: &str) -> Result<(Vec<u8>, u32), PipelineError> {
        let attempts = self.processing.fetch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.collab.source.fetch(identity).await {
                Ok(bytes) => return Ok((bytes, attempt)),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.processing.fetch_backoff_ms << (attempt - 1).min(6);
                    warn!(identity, attempt, error = %e, "fetch failed, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fetch_stage(&self, doc: &TrackedDocument) -> Result<(Vec<u8>, String), PipelineError> {
        let (bytes, attempt) = self.fetch_document(&doc.identity).await?;

        let actual = fingerprint(&bytes);
        if actual != doc.fingerprint {
            return Err(PipelineError::Validation(format!(
                "fingerprint mismatch: recorded {} but fetched {}",
                short(&doc.fingerprint),
                short(&actual)
            )));
        }

        let summary = format!("{} bytes in {} attempt(s)", bytes.len(), attempt);
        Ok((bytes, summary))
    }

    async fn extract_text_stage(
        &self,
        doc: &TrackedDocument,
        bytes: Vec<u8>,
    ) -> Result<(String, String), PipelineError> {
        let extracted = self.collab.content.extract(bytes, &doc.name).await?;
        let visible = extracted.text.chars().filter(|c| !c.is_whitespace()).count();
        if visible < self.processing.min_text_chars {
            return Err(PipelineError::Validation(format!(
                "document text is empty or unreadable ({} characters)",
                visible
            )));
        }
        let summary = format!(
            "{} pages, {} characters",
            extracted.page_count,
            extracted.text.len()
        );
        Ok((extracted.text, summary))
    }

    async fn structured_stage(&self, text: &str) -> Result<(Structured, String), PipelineError> {
        let metadata = self
            .collab
            .structured
            .extract_metadata(text)
            .await?
            .ok_or_else(|| PipelineError::Validation("no tender metadata extracted".into()))?;

        let reference = metadata
            .reference_number
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Validation("metadata has no tender reference number".into())
            })?;

        let criteria = self
            .collab
            .structured
            .extract_list(text, ListKind::QualificationCriteria)
            .await?;
        let documents = self
            .collab
            .structured
            .extract_list(text, ListKind::RequiredDocuments)
            .await?;

        let summary = format!(
            "{}: {} criteria, {} required documents",
            reference,
            criteria.len(),
            documents.len()
        );
        Ok((
            Structured {
                reference,
                metadata,
                criteria,
                documents,
            },
            summary,
        ))
    }

    async fn persist_stage(
        &self,
        version_id: &str,
        s: &Structured,
    ) -> Result<(store::PersistSummary, String), PipelineError> {
        let still_latest = ledger::get_version(&self.pool, version_id)
            .await?
            .is_some_and(|doc| doc.is_latest);
        if !still_latest {
            return Err(PipelineError::Superseded {
                version_id: version_id.to_string(),
            });
        }

        let persisted = store::persist_entities(
            &self.pool,
            version_id,
            &s.reference,
            &s.metadata,
            &s.criteria,
            &s.documents,
        )
        .await?;
        let summary = format!(
            "tender {}: +{} criteria, +{} required documents",
            persisted.reference_number, persisted.criteria_added, persisted.documents_added
        );
        Ok((persisted, summary))
    }

    async fn chunk_embed_stage(
        &self,
        version_id: &str,
        tender_id: &str,
        text: &str,
    ) -> Result<(usize, String), PipelineError> {
        let chunks = chunk_words(text, &self.chunking);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.collab.embedder.embed(&texts).await?
        };
        if vectors.len() != texts.len() {
            return Err(EmbedError::LengthMismatch {
                expected: texts.len(),
                got: vectors.len(),
            }
            .into());
        }

        let stored = store::replace_chunks(
            &self.pool,
            version_id,
            tender_id,
            &chunks,
            &vectors,
            self.collab.embedder.model_name(),
        )
        .await?;
        Ok((stored, format!("{} chunks embedded", stored)))
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
