//! Scanning, dispatch, and the monitor loop.
//!
//! A scan lists the source, fingerprints each document, classifies it, and
//! records a ledger version when needed. Processable versions are handed to
//! a [`Dispatcher`], which runs them on a `JoinSet` bounded by a semaphore,
//! so listing and classification never wait on pipeline runs. Fetches made
//! during discovery run under the stage timeout, and the monitor abandons
//! an in-progress scan as soon as shutdown is requested.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::detect::{self, Classification};
use crate::embedding;
use crate::error::PipelineError;
use crate::extract::DocumentTextExtractor;
use crate::ledger;
use crate::migrate;
use crate::models::{ProcessingStatus, VersionMetadata};
use crate::pipeline::{Collaborators, Pipeline, RunOutcome};
use crate::source::FilesystemSource;
use crate::state;
use crate::structured;
use crate::traits::DiscoveredDocument;

/// Attempts at classify-then-record before giving up on a contended identity.
const RECORD_ATTEMPTS: usize = 3;

/// Wire the configured collaborators into a pipeline.
pub async fn build_pipeline(config: &Config, shutdown: CancellationToken) -> Result<Pipeline> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let collab = Collaborators {
        source: Arc::new(FilesystemSource::new(&config.source)?),
        content: Arc::new(DocumentTextExtractor::new()),
        structured: structured::create_extractor(&config.extraction)?,
        embedder: embedding::create_service(&config.embedding, &config.extraction)?,
    };

    Ok(Pipeline::new(pool, collab, config, shutdown))
}

// ============ Dispatch ============

/// Tally of finished pipeline runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunTally {
    pub completed: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RunTally {
    fn record(&mut self, version_id: &str, result: Result<RunOutcome, PipelineError>) {
        match result {
            Ok(RunOutcome::Completed {
                tender_reference,
                chunks,
            }) => {
                self.completed += 1;
                info!(version_id, tender_reference = %tender_reference, chunks, "run completed");
            }
            Ok(RunOutcome::Failed {
                error,
                retry_count,
                exhausted,
            }) => {
                if exhausted {
                    self.exhausted += 1;
                } else {
                    self.failed += 1;
                }
                warn!(version_id, retry_count, exhausted, error = %error, "run failed");
            }
            Ok(RunOutcome::NotClaimed(_)) => self.skipped += 1,
            Err(e) => {
                self.errors += 1;
                error!(version_id, error = %e, "run could not record its outcome");
            }
        }
    }
}

type RunResult = (String, Result<RunOutcome, PipelineError>);

/// Runs pipeline jobs concurrently, at most `max_concurrency` at a time.
pub struct Dispatcher {
    runs: JoinSet<RunResult>,
    permits: Arc<Semaphore>,
    tally: RunTally,
}

impl Dispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            runs: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tally: RunTally::default(),
        }
    }

    pub fn dispatch(&mut self, pipeline: &Pipeline, version_id: String) {
        let pipeline = pipeline.clone();
        let permits = self.permits.clone();
        self.runs.spawn(async move {
            // The semaphore is never closed, so acquiring only waits.
            let _permit = permits.acquire_owned().await;
            let result = pipeline.run(&version_id).await;
            (version_id, result)
        });
    }

    pub fn in_flight(&self) -> usize {
        self.runs.len()
    }

    /// Wait for the next run to finish and tally it. `None` when idle.
    pub async fn join_next(&mut self) -> Option<()> {
        let joined = self.runs.join_next().await?;
        match joined {
            Ok((version_id, result)) => self.tally.record(&version_id, result),
            Err(e) => {
                self.tally.errors += 1;
                error!(error = %e, "pipeline task panicked");
            }
        }
        Some(())
    }

    pub async fn drain(&mut self) {
        while self.join_next().await.is_some() {}
    }

    pub fn tally(&self) -> &RunTally {
        &self.tally
    }
}

// ============ Scan ============

/// Classification counts for one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub discovered: usize,
    pub new: usize,
    pub new_version: usize,
    pub unchanged: usize,
    pub reprocess_failed: usize,
    pub exhausted: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub errors: usize,
    pub dispatched: usize,
}

impl ScanSummary {
    fn count(&mut self, classification: &Classification) {
        match classification {
            Classification::New => self.new += 1,
            Classification::NewVersion { .. } => self.new_version += 1,
            Classification::Unchanged { .. } => self.unchanged += 1,
            Classification::ReprocessFailed { .. } => self.reprocess_failed += 1,
            Classification::Exhausted { .. } => self.exhausted += 1,
            Classification::Pending { .. } => self.pending += 1,
            Classification::InFlight { .. } => self.in_flight += 1,
        }
    }
}

/// Classify a discovered document and record a version if it needs one.
///
/// Returns the classification and, when the document should be processed,
/// the version id to run. Ledger conflicts are retried by classifying again.
pub async fn discover(
    pipeline: &Pipeline,
    doc: &DiscoveredDocument,
) -> Result<(Classification, Option<String>), PipelineError> {
    let fingerprint = match &doc.fingerprint {
        Some(fp) => fp.clone(),
        None => detect::fingerprint(&fetch_for_fingerprint(pipeline, &doc.identity).await?),
    };
    let metadata = VersionMetadata {
        name: doc.name.clone(),
        path: doc.path.clone(),
        size_bytes: doc.size_bytes,
        source_modified_at: doc.modified_at,
    };
    let max_retries = pipeline.processing().max_retries;

    let mut last_conflict = None;
    for _ in 0..RECORD_ATTEMPTS {
        let classification =
            detect::classify(pipeline.pool(), &doc.identity, &fingerprint, max_retries).await?;

        if !matches!(
            classification,
            Classification::New | Classification::NewVersion { .. }
        ) {
            let existing = if classification.should_process() {
                classification.version_id().map(str::to_string)
            } else {
                None
            };
            return Ok((classification, existing));
        }

        let previous = match &classification {
            Classification::NewVersion { previous } => Some(previous.clone()),
            _ => None,
        };

        match ledger::record_version(
            pipeline.pool(),
            &doc.identity,
            &fingerprint,
            &metadata,
            previous.as_deref(),
        )
        .await
        {
            Ok(version_id) => return Ok((classification, Some(version_id))),
            Err(e @ PipelineError::Conflict { .. }) => {
                warn!(identity = %doc.identity, error = %e, "ledger conflict, reclassifying");
                last_conflict = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_conflict.unwrap_or_else(|| PipelineError::Conflict {
        identity: doc.identity.clone(),
        detail: "gave up after repeated conflicts".to_string(),
    }))
}

async fn fetch_for_fingerprint(
    pipeline: &Pipeline,
    identity: &str,
) -> Result<Vec<u8>, PipelineError> {
    let processing = pipeline.processing();
    let fetch = pipeline.fetch_document(identity);
    match tokio::time::timeout(processing.stage_timeout(), fetch).await {
        Ok(fetched) => fetched.map(|(bytes, _)| bytes),
        Err(_) => Err(PipelineError::Timeout {
            stage: "discover".to_string(),
            secs: processing.stage_timeout_secs,
        }),
    }
}

/// One pass over the source. Processable versions go to `dispatcher`;
/// a failing document is counted and skipped. Stops early on shutdown.
pub async fn scan_once(
    pipeline: &Pipeline,
    container: &str,
    dispatcher: &mut Dispatcher,
) -> Result<ScanSummary, PipelineError> {
    let docs = pipeline.source().list(container).await?;
    let mut summary = ScanSummary {
        discovered: docs.len(),
        ..Default::default()
    };

    for doc in &docs {
        if pipeline.shutdown_token().is_cancelled() {
            info!("shutdown requested, scan stopped early");
            break;
        }
        match discover(pipeline, doc).await {
            Ok((classification, version_id)) => {
                summary.count(&classification);
                if let Classification::Exhausted { retry_count, .. } = &classification {
                    warn!(identity = %doc.identity, retry_count, "exhausted; needs manual process --force");
                }
                if let Some(version_id) = version_id {
                    dispatcher.dispatch(pipeline, version_id);
                    summary.dispatched += 1;
                }
            }
            Err(e) => {
                summary.errors += 1;
                error!(identity = %doc.identity, error = %e, "discovery failed");
            }
        }
    }

    info!(
        discovered = summary.discovered,
        dispatched = summary.dispatched,
        unchanged = summary.unchanged,
        "scan finished"
    );
    Ok(summary)
}

/// Process one identity on demand.
///
/// The document is re-discovered first when the source still lists it, so
/// an edited file becomes a new version. An exhausted version is refused
/// unless `force` resets it.
pub async fn process_identity(
    pipeline: &Pipeline,
    identity: &str,
    force: bool,
) -> Result<RunOutcome, PipelineError> {
    let listed = pipeline
        .source()
        .list("")
        .await?
        .into_iter()
        .find(|d| d.identity == identity);
    if let Some(doc) = listed {
        discover(pipeline, &doc).await?;
    }

    let version = ledger::latest_version(pipeline.pool(), identity)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("unknown document: {}", identity)))?;

    let policy = pipeline.retry_policy();
    if let Some(record) = state::get_record(pipeline.pool(), &version.id).await? {
        let retry_count = record.retry_count.max(0) as u32;
        if record.status() == ProcessingStatus::Failed {
            if force {
                state::reset(pipeline.pool(), &version.id).await?;
            } else if retry_count >= policy.max_retries {
                return Err(PipelineError::ExhaustedRetries {
                    version_id: version.id,
                    retry_count,
                });
            }
        }
    }

    pipeline.run(&version.id).await
}

// ============ Commands ============

pub async fn run_scan(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config, CancellationToken::new()).await?;
    let mut dispatcher = Dispatcher::new(config.processing.max_concurrency);

    let summary = scan_once(&pipeline, "", &mut dispatcher).await?;
    dispatcher.drain().await;

    print_scan(&summary);
    print_tally(dispatcher.tally());
    pipeline.pool().close().await;
    Ok(())
}

/// Poll the source until Ctrl-C, then let in-flight runs reach a stage
/// boundary and exit.
pub async fn run_monitor(config: &Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let pipeline = build_pipeline(config, shutdown.clone()).await?;

    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            token.cancel();
        }
    });

    monitor(&pipeline, "").await?;
    pipeline.pool().close().await;
    Ok(())
}

/// The polling loop. Returns once the pipeline's shutdown token fires and
/// every dispatched run has finished.
pub async fn monitor(pipeline: &Pipeline, container: &str) -> Result<RunTally, PipelineError> {
    let processing = pipeline.processing().clone();
    let shutdown = pipeline.shutdown_token().clone();

    state::recover_stale_claims(pipeline.pool(), pipeline.max_run_secs(), processing.max_retries)
        .await?;

    let mut dispatcher = Dispatcher::new(processing.max_concurrency);
    let mut ticker = tokio::time::interval(processing.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval_secs = processing.poll_interval_secs,
        max_concurrency = processing.max_concurrency,
        "monitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    scanned = scan_once(pipeline, container, &mut dispatcher) => {
                        if let Err(e) = scanned {
                            error!(error = %e, "scan failed; will retry next tick");
                        }
                    }
                }
            }
            Some(()) = dispatcher.join_next(), if dispatcher.in_flight() > 0 => {}
        }
    }

    let in_flight = dispatcher.in_flight();
    if in_flight > 0 {
        info!(count = in_flight, "waiting for running pipelines to stop");
    }
    dispatcher.drain().await;
    info!("monitor stopped");
    Ok(dispatcher.tally().clone())
}

/// Retry every failed version whose backoff elapsed.
pub async fn run_retry(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config, CancellationToken::new()).await?;
    let (recovered, tally) = retry_sweep(&pipeline).await?;

    println!("retry");
    println!("  expired claims: {}", recovered);
    print_tally(&tally);
    pipeline.pool().close().await;
    Ok(())
}

pub async fn retry_sweep(pipeline: &Pipeline) -> Result<(usize, RunTally), PipelineError> {
    let policy = pipeline.retry_policy();
    let recovered =
        state::recover_stale_claims(pipeline.pool(), pipeline.max_run_secs(), policy.max_retries)
            .await?;

    let candidates = state::due_for_retry(pipeline.pool(), &policy).await?;
    info!(count = candidates.len(), "retrying failed versions");

    let mut dispatcher = Dispatcher::new(pipeline.processing().max_concurrency);
    for candidate in candidates {
        info!(
            version_id = %candidate.version_id,
            identity = %candidate.identity,
            retry_count = candidate.retry_count,
            "retry"
        );
        dispatcher.dispatch(pipeline, candidate.version_id);
    }
    dispatcher.drain().await;
    Ok((recovered, dispatcher.tally().clone()))
}

pub async fn run_process(config: &Config, identity: &str, force: bool) -> Result<()> {
    let pipeline = build_pipeline(config, CancellationToken::new()).await?;
    let result = process_identity(&pipeline, identity, force).await;
    pipeline.pool().close().await;

    match result? {
        RunOutcome::Completed {
            tender_reference,
            chunks,
        } => {
            println!("process {}", identity);
            println!("  status: completed");
            println!("  tender: {}", tender_reference);
            println!("  chunks: {}", chunks);
        }
        RunOutcome::Failed {
            error,
            retry_count,
            exhausted,
        } => {
            println!("process {}", identity);
            println!(
                "  status: {}",
                if exhausted { "exhausted" } else { "failed" }
            );
            println!("  attempts: {}/{}", retry_count, config.processing.max_retries);
            println!("  error: {}", error);
        }
        RunOutcome::NotClaimed(claim) => {
            bail!("{} was not processed: {:?}", identity, claim);
        }
    }
    Ok(())
}

fn print_scan(summary: &ScanSummary) {
    println!("scan");
    println!("  discovered: {}", summary.discovered);
    println!("  new: {}", summary.new);
    println!("  new versions: {}", summary.new_version);
    println!("  unchanged: {}", summary.unchanged);
    println!("  pending: {}", summary.pending);
    println!("  retryable: {}", summary.reprocess_failed);
    println!("  exhausted: {}", summary.exhausted);
    println!("  in flight: {}", summary.in_flight);
    println!("  errors: {}", summary.errors);
}

fn print_tally(tally: &RunTally) {
    println!("  completed: {}", tally.completed);
    println!("  failed: {}", tally.failed);
    println!("  exhausted: {}", tally.exhausted);
    println!("  skipped: {}", tally.skipped);
    if tally.errors > 0 {
        println!("  errors: {}", tally.errors);
    }
}
