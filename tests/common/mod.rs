//! Shared fixtures: an in-memory document source, a scripted structured
//! extractor, and a pipeline wired to a temporary SQLite database.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tender_intake::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, ExtractionConfig, ProcessingConfig,
    SourceConfig,
};
use tender_intake::detect;
use tender_intake::embedding::HashEmbedder;
use tender_intake::error::{EmbedError, SourceError, StructuredError};
use tender_intake::extract::DocumentTextExtractor;
use tender_intake::models::{ExtractedItem, ListKind, TenderMetadata};
use tender_intake::pipeline::{Collaborators, Pipeline};
use tender_intake::traits::{DiscoveredDocument, DocumentSource, EmbeddingService, StructuredExtractor};
use tender_intake::{db, migrate};

// ============ Source ============

#[derive(Default)]
pub struct MemorySource {
    docs: Mutex<BTreeMap<String, Vec<u8>>>,
    pub report_fingerprint: bool,
    transient_failures: AtomicUsize,
    hang: AtomicBool,
    pub fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new(report_fingerprint: bool) -> Self {
        Self {
            report_fingerprint,
            ..Default::default()
        }
    }

    pub fn put(&self, identity: &str, body: &str) {
        self.docs
            .lock()
            .unwrap()
            .insert(identity.to_string(), body.as_bytes().to_vec());
    }

    /// The next `n` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Every later fetch never returns.
    pub fn hang_fetches(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn list(&self, _container: &str) -> Result<Vec<DiscoveredDocument>, SourceError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .iter()
            .map(|(identity, bytes)| DiscoveredDocument {
                identity: identity.clone(),
                name: identity.rsplit('/').next().unwrap_or(identity.as_str()).to_string(),
                path: Some(identity.clone()),
                fingerprint: self.report_fingerprint.then(|| detect::fingerprint(bytes)),
                size_bytes: bytes.len() as i64,
                modified_at: Some(1_700_000_000),
            })
            .collect())
    }

    async fn fetch(&self, identity: &str) -> Result<Vec<u8>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Unavailable("503 from source".into()));
        }
        self.docs
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(identity.to_string()))
    }
}

// ============ Structured extractor ============

/// Reads `REF:`, `TITLE:`, `AUTHORITY:`, `CRITERION: category | text` and
/// `DOC: text` lines out of the document.
#[derive(Default)]
pub struct ScriptedExtractor {
    failures: AtomicUsize,
    delay_ms: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    last_context: Mutex<Option<String>>,
}

impl ScriptedExtractor {
    /// The next `n` metadata calls return a malformed-reply error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Context passed to the most recent `answer` call.
    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }
}

fn field(text: &str, key: &str) -> Option<String> {
    text.lines()
        .find_map(|l| l.trim().strip_prefix(key))
        .map(|v| v.trim().to_string())
}

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract_metadata(
        &self,
        text: &str,
    ) -> Result<Option<TenderMetadata>, StructuredError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StructuredError::Malformed("reply was not JSON".into()));
        }
        if !text.contains("REF:") && !text.contains("TITLE:") {
            return Ok(None);
        }
        Ok(Some(TenderMetadata {
            reference_number: field(text, "REF:"),
            title: field(text, "TITLE:"),
            issuing_authority: field(text, "AUTHORITY:"),
            ..Default::default()
        }))
    }

    async fn extract_list(
        &self,
        text: &str,
        kind: ListKind,
    ) -> Result<Vec<ExtractedItem>, StructuredError> {
        let items = text
            .lines()
            .filter_map(|line| match kind {
                ListKind::QualificationCriteria => {
                    line.trim().strip_prefix("CRITERION:").map(|rest| {
                        let (category, description) =
                            rest.split_once('|').unwrap_or(("general", rest));
                        ExtractedItem {
                            category: category.trim().to_string(),
                            description: description.trim().to_string(),
                            mandatory: true,
                        }
                    })
                }
                ListKind::RequiredDocuments => {
                    line.trim().strip_prefix("DOC:").map(|rest| ExtractedItem {
                        category: "document".to_string(),
                        description: rest.trim().to_string(),
                        mandatory: true,
                    })
                }
            })
            .collect();
        Ok(items)
    }

    async fn answer(&self, question: &str, context: &str) -> Result<String, StructuredError> {
        *self.last_context.lock().unwrap() = Some(context.to_string());
        Ok(format!("answered: {}", question))
    }
}

// ============ Embedding ============

/// Drops the last vector to break the length contract.
pub struct ShortEmbedder;

#[async_trait]
impl EmbeddingService for ShortEmbedder {
    fn model_name(&self) -> &str {
        "short"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .skip(1)
            .map(|_| vec![1.0, 0.0, 0.0, 0.0])
            .collect())
    }
}

// ============ Wiring ============

pub fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("data/tender.sqlite"),
        },
        source: SourceConfig {
            root: tmp.path().join("inbox"),
            include_globs: vec!["**/*.txt".into()],
            exclude_globs: vec![],
            follow_symlinks: false,
        },
        chunking: ChunkingConfig {
            window_words: 12,
            overlap_words: 4,
            min_chars: 10,
        },
        processing: ProcessingConfig {
            max_retries: 3,
            retry_delay_secs: 0,
            poll_interval_secs: 3600,
            max_concurrency: 2,
            stage_timeout_secs: 5,
            fetch_attempts: 3,
            fetch_backoff_ms: 1,
            min_text_chars: 10,
        },
        extraction: ExtractionConfig::default(),
        embedding: EmbeddingConfig {
            dims: Some(64),
            ..Default::default()
        },
    }
}

pub struct Harness {
    pub _tmp: TempDir,
    pub config: Config,
    pub pool: SqlitePool,
    pub source: Arc<MemorySource>,
    pub extractor: Arc<ScriptedExtractor>,
    pub shutdown: CancellationToken,
    pub pipeline: Pipeline,
}

pub async fn harness() -> Harness {
    harness_with(MemorySource::new(false), |_| {}, None).await
}

pub async fn harness_with(
    source: MemorySource,
    tweak: impl FnOnce(&mut Config),
    embedder: Option<Arc<dyn EmbeddingService>>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    tweak(&mut config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    let source = Arc::new(source);
    let extractor = Arc::new(ScriptedExtractor::default());
    let embedder = embedder.unwrap_or_else(|| Arc::new(HashEmbedder::new(64)));
    let shutdown = CancellationToken::new();

    let collab = Collaborators {
        source: source.clone(),
        content: Arc::new(DocumentTextExtractor::new()),
        structured: extractor.clone(),
        embedder,
    };
    let pipeline = Pipeline::new(pool.clone(), collab, &config, shutdown.clone());

    Harness {
        _tmp: tmp,
        config,
        pool,
        source,
        extractor,
        shutdown,
        pipeline,
    }
}

/// A tender document body in the scripted extractor's format. `extra`
/// lines are appended verbatim.
pub fn tender_doc(reference: &str, title: &str, extra: &[&str]) -> String {
    let mut body = format!(
        "INVITATION TO TENDER\nREF: {}\nTITLE: {}\n\
         CRITERION: financial | Annual turnover of at least 2 million over three years\n\
         CRITERION: experience | Three completed projects of similar scope and value\n\
         CRITERION: license | Registered contractor grade A1 or above\n\
         DOC: Form of Tender\n\
         The contractor shall resurface the access road and provide drainage works \
         along the northern boundary in accordance with the contract drawings.\n",
        reference, title
    );
    for line in extra {
        body.push_str(line);
        body.push('\n');
    }
    body
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
