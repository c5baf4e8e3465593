//! End-to-end pipeline scenarios against a temporary SQLite database with
//! in-memory collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{count, harness, harness_with, tender_doc, MemorySource, ShortEmbedder};
use tender_intake::audit::{self, stage};
use tender_intake::detect::{self, Classification};
use tender_intake::embedding::HashEmbedder;
use tender_intake::error::PipelineError;
use tender_intake::ingest::{self, Dispatcher};
use tender_intake::ledger;
use tender_intake::models::{ProcessingStatus, VersionMetadata};
use tender_intake::pipeline::RunOutcome;
use tender_intake::report;
use tender_intake::search;
use tender_intake::state::{self, ClaimOutcome};
use tender_intake::store::{self, ItemTable};

const F1: &str = "tenders/f1.txt";

async fn scan(h: &common::Harness) -> (ingest::ScanSummary, ingest::RunTally) {
    let mut dispatcher = Dispatcher::new(h.config.processing.max_concurrency);
    let summary = ingest::scan_once(&h.pipeline, "", &mut dispatcher)
        .await
        .unwrap();
    dispatcher.drain().await;
    (summary, dispatcher.tally().clone())
}

async fn latest_id(h: &common::Harness, identity: &str) -> String {
    ledger::latest_version(&h.pool, identity)
        .await
        .unwrap()
        .expect("latest version")
        .id
}

fn meta(name: &str) -> VersionMetadata {
    VersionMetadata {
        name: name.to_string(),
        path: Some(name.to_string()),
        size_bytes: 10,
        source_modified_at: None,
    }
}

#[tokio::test]
async fn test_new_document_is_processed_once() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));

    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.new, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(tally.completed, 1);

    let tender = store::get_tender(&h.pool, "TND-001").await.unwrap().unwrap();
    assert_eq!(tender.title.as_deref(), Some("Road resurfacing"));
    let criteria = store::list_items(&h.pool, &tender.id, ItemTable::Criteria)
        .await
        .unwrap();
    assert_eq!(criteria.len(), 3);
    let docs = store::list_items(&h.pool, &tender.id, ItemTable::RequiredDocuments)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert!(count(&h.pool, "SELECT COUNT(*) FROM tender_chunks").await > 0);

    // Same bytes again: nothing new is recorded or run.
    let audit_before = count(&h.pool, "SELECT COUNT(*) FROM audit_log").await;
    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(tally.completed, 0);
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM audit_log").await,
        audit_before
    );
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM tracked_documents").await,
        1
    );
    assert_eq!(h.extractor.metadata_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_edited_document_becomes_new_version() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;

    h.source.put(
        F1,
        &tender_doc(
            "TND-001",
            "Road resurfacing phase 2",
            &["CRITERION: safety | Valid health and safety certification"],
        ),
    );
    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.new_version, 1);
    assert_eq!(tally.completed, 1);

    let versions = ledger::lineage(&h.pool, F1).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version_number, 2);
    assert!(versions[0].is_latest);
    assert!(!versions[1].is_latest);
    assert_eq!(
        versions[0].previous_version_id.as_deref(),
        Some(versions[1].id.as_str())
    );

    // The tender is updated in place; repeated criteria are not duplicated.
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM tenders").await, 1);
    let tender = store::get_tender(&h.pool, "TND-001").await.unwrap().unwrap();
    assert_eq!(tender.title.as_deref(), Some("Road resurfacing phase 2"));
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM tender_qualification_criteria").await,
        4
    );
}

#[tokio::test]
async fn test_reverted_content_stays_unchanged() {
    let h = harness().await;
    let original = tender_doc("TND-001", "Road resurfacing", &[]);
    h.source.put(F1, &original);
    scan(&h).await;
    h.source
        .put(F1, &tender_doc("TND-001", "Road resurfacing amended", &[]));
    scan(&h).await;

    h.source.put(F1, &original);
    let (summary, _) = scan(&h).await;
    assert_eq!(summary.unchanged, 1);
    assert_eq!(ledger::lineage(&h.pool, F1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_same_content_under_two_identities_shares_one_tender() {
    let h = harness().await;
    let body = tender_doc("TND-002", "Bridge maintenance", &[]);
    h.source.put("a/notice.txt", &body);
    h.source.put("b/notice-copy.txt", &body);

    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.new, 2);
    assert_eq!(tally.completed, 2);

    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM tracked_documents").await,
        2
    );
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM tenders").await, 1);
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM tender_qualification_criteria").await,
        3
    );
}

#[tokio::test]
async fn test_completed_version_is_not_rerun() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;
    let vid = latest_id(&h, F1).await;

    let audit_before = count(&h.pool, "SELECT COUNT(*) FROM audit_log").await;
    let outcome = h.pipeline.run(&vid).await.unwrap();
    assert_eq!(outcome, RunOutcome::NotClaimed(ClaimOutcome::AlreadyCompleted));
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM audit_log").await,
        audit_before
    );
}

#[tokio::test]
async fn test_stages_are_audited_in_order() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;
    let vid = latest_id(&h, F1).await;

    let entries = audit::entries_for(&h.pool, &vid).await.unwrap();
    let stages: Vec<&str> = entries.iter().map(|e| e.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            stage::DISCOVER,
            stage::CLAIM,
            stage::FETCH,
            stage::EXTRACT_TEXT,
            stage::EXTRACT_STRUCTURED,
            stage::PERSIST,
            stage::CHUNK_EMBED,
            stage::COMPLETE,
        ]
    );
    for entry in &entries {
        assert_eq!(entry.outcome, "succeeded");
        assert!(entry.finished_at_ms >= entry.started_at_ms);
        assert_eq!(entry.duration_ms, entry.finished_at_ms - entry.started_at_ms);
    }

    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Completed);
    assert_eq!(record.tender_reference.as_deref(), Some("TND-001"));
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_validation_failures_exhaust_retries() {
    let h = harness().await;
    h.extractor.fail_next(10);
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));

    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);
    let vid = latest_id(&h, F1).await;

    let second = h.pipeline.run(&vid).await.unwrap();
    assert!(matches!(
        second,
        RunOutcome::Failed {
            retry_count: 2,
            exhausted: false,
            ..
        }
    ));
    let third = h.pipeline.run(&vid).await.unwrap();
    assert!(matches!(
        third,
        RunOutcome::Failed {
            retry_count: 3,
            exhausted: true,
            ..
        }
    ));

    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.last_error.unwrap().contains("validation"));

    let fp = detect::fingerprint(tender_doc("TND-001", "Road resurfacing", &[]).as_bytes());
    let classification = detect::classify(&h.pool, F1, &fp, 3).await.unwrap();
    assert_eq!(
        classification,
        Classification::Exhausted {
            version_id: vid.clone(),
            retry_count: 3
        }
    );

    // Further runs and scans leave it alone.
    let fourth = h.pipeline.run(&vid).await.unwrap();
    assert_eq!(
        fourth,
        RunOutcome::NotClaimed(ClaimOutcome::Exhausted { retry_count: 3 })
    );
    let (summary, _) = scan(&h).await;
    assert_eq!(summary.exhausted, 1);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.extractor.metadata_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_force_resets_exhausted_version() {
    let h = harness().await;
    h.extractor.fail_next(3);
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;
    let vid = latest_id(&h, F1).await;
    h.pipeline.run(&vid).await.unwrap();
    h.pipeline.run(&vid).await.unwrap();

    let err = ingest::process_identity(&h.pipeline, F1, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ExhaustedRetries { retry_count: 3, .. }
    ));

    let outcome = ingest::process_identity(&h.pipeline, F1, true)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { ref tender_reference, .. } if tender_reference == "TND-001"));

    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Completed);
    assert_eq!(record.retry_count, 0);
    let stages: Vec<String> = audit::entries_for(&h.pool, &vid)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.stage)
        .collect();
    assert!(stages.iter().any(|s| s == stage::RESET));
}

#[tokio::test]
async fn test_process_unknown_identity_fails() {
    let h = harness().await;
    let err = ingest::process_identity(&h.pipeline, "nope.txt", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown document"));
}

#[tokio::test]
async fn test_retry_sweep_reruns_failed_versions() {
    let h = harness().await;
    h.extractor.fail_next(1);
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);

    let (recovered, tally) = ingest::retry_sweep(&h.pipeline).await.unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(tally.completed, 1);
}

#[tokio::test]
async fn test_transient_fetch_errors_are_retried_within_stage() {
    let h = harness_with(MemorySource::new(true), |_| {}, None).await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    h.source.fail_next_fetches(2);

    let (_, tally) = scan(&h).await;
    assert_eq!(tally.completed, 1);
    assert_eq!(h.source.fetch_count(), 3);

    let vid = latest_id(&h, F1).await;
    let fetch = audit::entries_for(&h.pool, &vid)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.stage == stage::FETCH)
        .unwrap();
    assert!(fetch.detail.unwrap().contains("3 attempt(s)"));
}

#[tokio::test]
async fn test_fetch_gives_up_after_configured_attempts() {
    let h = harness_with(MemorySource::new(true), |_| {}, None).await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    h.source.fail_next_fetches(10);

    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);
    assert_eq!(h.source.fetch_count(), 3);

    let vid = latest_id(&h, F1).await;
    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert!(record.last_error.unwrap().contains("transient_io"));
}

#[tokio::test]
async fn test_content_changed_after_discovery_fails_fingerprint_check() {
    let h = harness_with(MemorySource::new(true), |_| {}, None).await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    let listed = h.pipeline.source().list("").await.unwrap();
    let (classification, vid) = ingest::discover(&h.pipeline, &listed[0]).await.unwrap();
    assert_eq!(classification, Classification::New);

    h.source
        .put(F1, &tender_doc("TND-001", "Road resurfacing v2", &[]));
    let outcome = h.pipeline.run(&vid.unwrap()).await.unwrap();
    match outcome {
        RunOutcome::Failed { error, .. } => assert!(error.contains("fingerprint mismatch")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_short_text_fails_extraction() {
    let h = harness().await;
    h.source.put(F1, "  tiny \n");
    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);
    assert_eq!(h.extractor.metadata_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_reference_number_fails() {
    let h = harness().await;
    h.source.put(
        F1,
        "TITLE: Untitled works\nA notice with a title but no reference of any kind at all.\n",
    );
    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);

    let vid = latest_id(&h, F1).await;
    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert!(record.last_error.unwrap().contains("reference number"));
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM tenders").await, 0);
}

#[tokio::test]
async fn test_empty_lists_are_valid() {
    let h = harness().await;
    h.source.put(
        F1,
        "REF: TND-009\nTITLE: Office cleaning\nGeneral description of cleaning services required.\n",
    );
    let (_, tally) = scan(&h).await;
    assert_eq!(tally.completed, 1);

    let tender = store::get_tender(&h.pool, "TND-009").await.unwrap().unwrap();
    assert!(store::list_items(&h.pool, &tender.id, ItemTable::Criteria)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_embedding_length_mismatch_fails() {
    let h = harness_with(
        MemorySource::new(false),
        |_| {},
        Some(Arc::new(ShortEmbedder)),
    )
    .await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);

    let vid = latest_id(&h, F1).await;
    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert!(record.last_error.unwrap().contains("vectors"));
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM tender_chunks").await, 0);
}

#[tokio::test]
async fn test_cancelled_run_stops_at_stage_boundary() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    let listed = h.pipeline.source().list("").await.unwrap();
    let (_, vid) = ingest::discover(&h.pipeline, &listed[0]).await.unwrap();
    let vid = vid.unwrap();

    h.shutdown.cancel();
    let outcome = h.pipeline.run(&vid).await.unwrap();
    match outcome {
        RunOutcome::Failed {
            error, retry_count, ..
        } => {
            assert!(error.contains("interrupted"));
            assert_eq!(retry_count, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let fetch = audit::entries_for(&h.pool, &vid)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.stage == stage::FETCH)
        .unwrap();
    assert_eq!(fetch.outcome, "skipped");
    assert_eq!(h.extractor.metadata_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_slow_stage_times_out() {
    let h = harness_with(
        MemorySource::new(false),
        |c| c.processing.stage_timeout_secs = 1,
        None,
    )
    .await;
    h.extractor.set_delay(Duration::from_secs(5));
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));

    let (_, tally) = scan(&h).await;
    assert_eq!(tally.failed, 1);

    let vid = latest_id(&h, F1).await;
    let structured = audit::entries_for(&h.pool, &vid)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.stage == stage::EXTRACT_STRUCTURED)
        .unwrap();
    assert_eq!(structured.outcome, "failed");
    assert!(structured.detail.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_superseded_version_cannot_be_claimed() {
    let h = harness().await;
    let policy = h.pipeline.retry_policy();
    let v1 = ledger::record_version(&h.pool, F1, "fp-1", &meta("f1.txt"), None)
        .await
        .unwrap();
    let v2 = ledger::record_version(&h.pool, F1, "fp-2", &meta("f1.txt"), Some(&v1))
        .await
        .unwrap();

    assert_eq!(
        state::claim(&h.pool, &v1, &policy).await.unwrap(),
        ClaimOutcome::Superseded
    );
    assert_eq!(
        state::claim(&h.pool, &v2, &policy).await.unwrap(),
        ClaimOutcome::Claimed
    );
    assert_eq!(
        state::claim(&h.pool, &v2, &policy).await.unwrap(),
        ClaimOutcome::Busy
    );
    assert_eq!(
        state::claim(&h.pool, "no-such-version", &policy)
            .await
            .unwrap(),
        ClaimOutcome::Missing
    );
}

#[tokio::test]
async fn test_claim_waits_for_sibling_version() {
    let h = harness().await;
    let policy = h.pipeline.retry_policy();
    let v1 = ledger::record_version(&h.pool, F1, "fp-1", &meta("f1.txt"), None)
        .await
        .unwrap();
    assert_eq!(
        state::claim(&h.pool, &v1, &policy).await.unwrap(),
        ClaimOutcome::Claimed
    );

    // A newer version arrives while v1 still runs.
    let v2 = ledger::record_version(&h.pool, F1, "fp-2", &meta("f1.txt"), Some(&v1))
        .await
        .unwrap();
    assert_eq!(
        state::claim(&h.pool, &v2, &policy).await.unwrap(),
        ClaimOutcome::Busy
    );

    // A superseded run is not retryable: it goes straight to the cap.
    let superseded = PipelineError::Superseded {
        version_id: v1.clone(),
    };
    assert_eq!(
        state::mark_failed(&h.pool, &v1, &superseded, 3).await.unwrap(),
        3
    );
    assert_eq!(
        state::claim(&h.pool, &v2, &policy).await.unwrap(),
        ClaimOutcome::Claimed
    );
}

#[tokio::test]
async fn test_older_version_never_overwrites_newer() {
    let h = harness().await;
    h.extractor.set_delay(Duration::from_millis(800));
    h.source.put(F1, &tender_doc("TND-001", "Old title", &[]));

    let mut first = Dispatcher::new(2);
    ingest::scan_once(&h.pipeline, "", &mut first).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while count(
        &h.pool,
        "SELECT COUNT(*) FROM processing_records WHERE status = 'processing'",
    )
    .await
        == 0
    {
        assert!(tokio::time::Instant::now() < deadline, "v1 was never claimed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.source.put(F1, &tender_doc("TND-001", "New title", &[]));
    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.new_version, 1);
    assert_eq!(tally.skipped, 1);

    first.drain().await;
    assert_eq!(first.tally().exhausted, 1);

    let versions = ledger::lineage(&h.pool, F1).await.unwrap();
    let (v2, v1) = (&versions[0], &versions[1]);
    assert!(v2.is_latest);
    let record = state::get_record(&h.pool, &v1.id).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Failed);
    assert!(record.last_error.unwrap().contains("superseded"));
    assert!(store::get_tender(&h.pool, "TND-001").await.unwrap().is_none());
    let record = state::get_record(&h.pool, &v2.id).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Pending);

    h.extractor.set_delay(Duration::ZERO);
    let (summary, tally) = scan(&h).await;
    assert_eq!(summary.pending, 1);
    assert_eq!(tally.completed, 1);

    let tender = store::get_tender(&h.pool, "TND-001").await.unwrap().unwrap();
    assert_eq!(tender.title.as_deref(), Some("New title"));
    let record = state::get_record(&h.pool, &v2.id).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Completed);
}

#[tokio::test]
async fn test_record_version_is_idempotent_and_detects_stale_previous() {
    let h = harness().await;
    let v1 = ledger::record_version(&h.pool, F1, "fp-1", &meta("f1.txt"), None)
        .await
        .unwrap();
    let again = ledger::record_version(&h.pool, F1, "fp-1", &meta("f1.txt"), None)
        .await
        .unwrap();
    assert_eq!(v1, again);

    let err = ledger::record_version(&h.pool, F1, "fp-2", &meta("f1.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Conflict { .. }));
    assert_eq!(ledger::lineage(&h.pool, F1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_claims_are_expired() {
    let h = harness().await;
    let policy = h.pipeline.retry_policy();
    let vid = ledger::record_version(&h.pool, F1, "fp-1", &meta("f1.txt"), None)
        .await
        .unwrap();
    assert_eq!(
        state::claim(&h.pool, &vid, &policy).await.unwrap(),
        ClaimOutcome::Claimed
    );

    // Fresh claims survive.
    assert_eq!(state::recover_stale_claims(&h.pool, 60, 3).await.unwrap(), 0);

    sqlx::query("UPDATE processing_records SET last_attempt_at = last_attempt_at - 10000")
        .execute(&h.pool)
        .await
        .unwrap();
    assert_eq!(state::recover_stale_claims(&h.pool, 60, 3).await.unwrap(), 1);

    let record = state::get_record(&h.pool, &vid).await.unwrap().unwrap();
    assert_eq!(record.status(), ProcessingStatus::Failed);
    assert_eq!(record.retry_count, 1);
    let stages: Vec<String> = audit::entries_for(&h.pool, &vid)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.stage)
        .collect();
    assert_eq!(stages.last().map(String::as_str), Some(stage::EXPIRE));
}

#[tokio::test]
async fn test_monitor_stops_on_shutdown() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));

    let pipeline = h.pipeline.clone();
    let handle = tokio::spawn(async move { ingest::monitor(&pipeline, "").await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let done = count(
            &h.pool,
            "SELECT COUNT(*) FROM processing_records WHERE status = 'completed'",
        )
        .await;
        if done == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "monitor never completed the document");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    h.shutdown.cancel();
    let tally = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(tally.completed, 1);
    assert_eq!(tally.failed, 0);
}

#[tokio::test]
async fn test_discovery_fetch_times_out() {
    let h = harness_with(
        MemorySource::new(false),
        |c| c.processing.stage_timeout_secs = 1,
        None,
    )
    .await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    h.source.hang_fetches();

    let listed = h.pipeline.source().list("").await.unwrap();
    let err = ingest::discover(&h.pipeline, &listed[0]).await.unwrap_err();
    assert!(matches!(err, PipelineError::Timeout { .. }));
    assert_eq!(
        count(&h.pool, "SELECT COUNT(*) FROM tracked_documents").await,
        0
    );
}

#[tokio::test]
async fn test_monitor_shutdown_interrupts_hung_scan() {
    let h = harness_with(
        MemorySource::new(false),
        |c| c.processing.stage_timeout_secs = 600,
        None,
    )
    .await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    h.source.hang_fetches();

    let pipeline = h.pipeline.clone();
    let handle = tokio::spawn(async move { ingest::monitor(&pipeline, "").await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.source.fetch_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "scan never fetched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.shutdown.cancel();
    let tally = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor did not stop while a fetch hung")
        .unwrap()
        .unwrap();
    assert_eq!(tally.completed, 0);
}

#[tokio::test]
async fn test_query_ranks_chunks_of_tender() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;

    let embedder = HashEmbedder::new(64);
    let matches = search::query_tender(
        &h.pool,
        &embedder,
        "TND-001",
        "drainage works northern boundary",
        3,
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!matches.is_empty());
    assert!(matches.len() <= 3);
    assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(matches.iter().all(|m| m.document_name == "f1.txt"));

    let unknown = search::query_tender(&h.pool, &embedder, "TND-404", "anything", 3)
        .await
        .unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn test_answer_uses_top_chunks_as_context() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;

    let embedder = HashEmbedder::new(64);
    let answer = search::answer_question(
        &h.pool,
        &embedder,
        h.extractor.as_ref(),
        "TND-001",
        "What drainage works are needed?",
        2,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(answer.text, "answered: What drainage works are needed?");
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.len() <= 2);

    let context = h.extractor.last_context().unwrap();
    assert!(context.starts_with("[f1.txt, chunk "));
    assert!(context.contains(&answer.sources[0].text));

    let unknown = search::answer_question(
        &h.pool,
        &embedder,
        h.extractor.as_ref(),
        "TND-404",
        "anything",
        2,
    )
    .await
    .unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn test_report_lists_source_documents() {
    let h = harness().await;
    h.source.put(F1, &tender_doc("TND-001", "Road resurfacing", &[]));
    scan(&h).await;

    let report = report::build_report(&h.pool, "TND-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.criteria.len(), 3);
    assert_eq!(report.required_documents.len(), 1);
    assert_eq!(report.sources.len(), 1);
    assert_eq!(report.sources[0].identity, F1);
    assert!(report.sources[0].document_type.is_some());

    assert!(report::build_report(&h.pool, "TND-404")
        .await
        .unwrap()
        .is_none());
}
