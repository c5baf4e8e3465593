//! Processing state machine.
//!
//! ```text
//!   pending ──claim──▶ processing ──▶ completed
//!                          │
//!                          ▼
//!   failed ◀───────────────┘
//!     │  claim (retry_count < max, backoff elapsed)
//!     └──────────▶ processing
//! ```
//!
//! `exhausted` is not stored: it is a failed record whose retry count has
//! reached the cap. Every transition is a conditional `UPDATE` guarded on
//! the prior state and is audited in the same transaction.
//!
//! At most one version of an identity is `processing` at a time: a claim is
//! refused while any sibling version holds one.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::audit::{self, stage, NewAuditEntry};
use crate::error::PipelineError;
use crate::models::{EffectiveStatus, ProcessingRecord, ProcessingStatus, StageOutcome};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

/// Result of a claim attempt. Only `Claimed` grants the right to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another worker holds the claim, on this version or a sibling.
    Busy,
    AlreadyCompleted,
    /// Failed recently; eligible again at `retry_at` (unix seconds).
    BackingOff { retry_at: i64 },
    /// A newer version of the same identity exists.
    Superseded,
    Exhausted { retry_count: u32 },
    Missing,
}

pub fn effective_status(
    status: ProcessingStatus,
    retry_count: u32,
    max_retries: u32,
) -> EffectiveStatus {
    match status {
        ProcessingStatus::Pending => EffectiveStatus::Pending,
        ProcessingStatus::Processing => EffectiveStatus::Processing,
        ProcessingStatus::Completed => EffectiveStatus::Completed,
        ProcessingStatus::Failed if retry_count >= max_retries => EffectiveStatus::Exhausted,
        ProcessingStatus::Failed => EffectiveStatus::Failed,
    }
}

pub async fn get_record(
    pool: &SqlitePool,
    version_id: &str,
) -> Result<Option<ProcessingRecord>, PipelineError> {
    let row = sqlx::query_as::<_, ProcessingRecord>(
        "SELECT version_id, status, retry_count, last_error, last_attempt_at, completed_at, \
                tender_reference, document_type, updated_at \
         FROM processing_records WHERE version_id = ?",
    )
    .bind(version_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Atomically move a version to `processing`.
pub async fn claim(
    pool: &SqlitePool,
    version_id: &str,
    policy: &RetryPolicy,
) -> Result<ClaimOutcome, PipelineError> {
    let now = Utc::now().timestamp();
    let backoff_cutoff = now - policy.retry_delay_secs as i64;

    let mut tx = pool.begin().await?;
    let claimed = sqlx::query(
        "UPDATE processing_records \
         SET status = 'processing', last_attempt_at = ?, updated_at = ? \
         WHERE version_id = ? \
           AND (status = 'pending' \
                OR (status = 'failed' AND retry_count < ? \
                    AND (last_attempt_at IS NULL OR last_attempt_at <= ?))) \
           AND EXISTS (SELECT 1 FROM tracked_documents d \
                       WHERE d.id = processing_records.version_id AND d.is_latest = 1) \
           AND NOT EXISTS (SELECT 1 FROM processing_records p2 \
                           JOIN tracked_documents d2 ON d2.id = p2.version_id \
                           JOIN tracked_documents d ON d.id = processing_records.version_id \
                           WHERE d2.identity = d.identity AND d2.id <> d.id \
                             AND p2.status = 'processing')",
    )
    .bind(now)
    .bind(now)
    .bind(version_id)
    .bind(policy.max_retries as i64)
    .bind(backoff_cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 1 {
        audit::append(
            &mut *tx,
            &NewAuditEntry::event(version_id, stage::CLAIM, StageOutcome::Succeeded, None),
        )
        .await?;
        tx.commit().await?;
        debug!(version_id, "claimed");
        return Ok(ClaimOutcome::Claimed);
    }
    tx.rollback().await?;

    diagnose_claim(pool, version_id, policy).await
}

async fn diagnose_claim(
    pool: &SqlitePool,
    version_id: &str,
    policy: &RetryPolicy,
) -> Result<ClaimOutcome, PipelineError> {
    let row: Option<(String, i64, Option<i64>, bool, i64)> = sqlx::query_as(
        "SELECT p.status, p.retry_count, p.last_attempt_at, d.is_latest, \
                (SELECT COUNT(*) FROM processing_records p2 \
                 JOIN tracked_documents d2 ON d2.id = p2.version_id \
                 WHERE d2.identity = d.identity AND d2.id <> d.id \
                   AND p2.status = 'processing') AS busy_siblings \
         FROM processing_records p JOIN tracked_documents d ON d.id = p.version_id \
         WHERE p.version_id = ?",
    )
    .bind(version_id)
    .fetch_optional(pool)
    .await?;

    let Some((status, retry_count, last_attempt_at, is_latest, busy_siblings)) = row else {
        return Ok(ClaimOutcome::Missing);
    };
    let retry_count = retry_count.max(0) as u32;
    let status: ProcessingStatus = status.parse().map_err(PipelineError::Validation)?;

    let outcome = match status {
        ProcessingStatus::Processing => ClaimOutcome::Busy,
        ProcessingStatus::Completed => ClaimOutcome::AlreadyCompleted,
        ProcessingStatus::Failed if retry_count >= policy.max_retries => {
            ClaimOutcome::Exhausted { retry_count }
        }
        _ if !is_latest => ClaimOutcome::Superseded,
        _ if busy_siblings > 0 => ClaimOutcome::Busy,
        ProcessingStatus::Failed => ClaimOutcome::BackingOff {
            retry_at: last_attempt_at.unwrap_or(0) + policy.retry_delay_secs as i64,
        },
        // Pending, latest, yet not claimed: someone else won the race.
        ProcessingStatus::Pending => ClaimOutcome::Busy,
    };
    Ok(outcome)
}

/// `processing → completed`.
pub async fn mark_completed(
    pool: &SqlitePool,
    version_id: &str,
    tender_reference: &str,
    document_type: &str,
) -> Result<(), PipelineError> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE processing_records \
         SET status = 'completed', completed_at = ?, tender_reference = ?, document_type = ?, \
             last_error = NULL, updated_at = ? \
         WHERE version_id = ? AND status = 'processing'",
    )
    .bind(now)
    .bind(tender_reference)
    .bind(document_type)
    .bind(now)
    .bind(version_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != 1 {
        tx.rollback().await?;
        return Err(PipelineError::Conflict {
            identity: version_id.to_string(),
            detail: "claim lost before completion".to_string(),
        });
    }

    audit::append(
        &mut *tx,
        &NewAuditEntry::event(
            version_id,
            stage::COMPLETE,
            StageOutcome::Succeeded,
            Some(format!("tender {}", tender_reference)),
        ),
    )
    .await?;
    tx.commit().await?;

    info!(version_id, tender_reference, "completed");
    Ok(())
}

/// `processing → failed`, incrementing the retry count up to `max_retries`.
/// A non-retryable error jumps straight to the cap. Returns the new retry
/// count.
pub async fn mark_failed(
    pool: &SqlitePool,
    version_id: &str,
    error: &PipelineError,
    max_retries: u32,
) -> Result<u32, PipelineError> {
    let step = if error.is_retryable() { 1 } else { max_retries };
    fail_with(
        pool,
        version_id,
        &format!("[{}] {}", error.kind(), error),
        step,
        max_retries,
        stage::FAIL,
    )
    .await
}

async fn fail_with(
    pool: &SqlitePool,
    version_id: &str,
    message: &str,
    step: u32,
    max_retries: u32,
    audit_stage: &str,
) -> Result<u32, PipelineError> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let retry_count: Option<i64> = sqlx::query_scalar(
        "UPDATE processing_records \
         SET status = 'failed', retry_count = MIN(retry_count + ?, ?), last_error = ?, \
             last_attempt_at = ?, updated_at = ? \
         WHERE version_id = ? AND status = 'processing' \
         RETURNING retry_count",
    )
    .bind(step as i64)
    .bind(max_retries as i64)
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(version_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(retry_count) = retry_count else {
        tx.rollback().await?;
        return Err(PipelineError::Conflict {
            identity: version_id.to_string(),
            detail: "claim lost before failure was recorded".to_string(),
        });
    };

    audit::append(
        &mut *tx,
        &NewAuditEntry::event(
            version_id,
            audit_stage,
            StageOutcome::Failed,
            Some(format!("attempt {}/{}: {}", retry_count, max_retries, message)),
        ),
    )
    .await?;
    tx.commit().await?;

    let retry_count = retry_count.max(0) as u32;
    if retry_count >= max_retries {
        warn!(version_id, retry_count, "retries exhausted");
    } else {
        warn!(version_id, retry_count, error = message, "processing failed");
    }
    Ok(retry_count)
}

/// Manual re-trigger: `failed → pending` with the retry count cleared.
/// Returns false when the version is not in `failed`.
pub async fn reset(pool: &SqlitePool, version_id: &str) -> Result<bool, PipelineError> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE processing_records \
         SET status = 'pending', retry_count = 0, updated_at = ? \
         WHERE version_id = ? AND status = 'failed'",
    )
    .bind(now)
    .bind(version_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    audit::append(
        &mut *tx,
        &NewAuditEntry::event(
            version_id,
            stage::RESET,
            StageOutcome::Succeeded,
            Some("manual reset".to_string()),
        ),
    )
    .await?;
    tx.commit().await?;
    info!(version_id, "reset to pending");
    Ok(true)
}

/// Fail claims older than `max_age_secs`, left behind by a crashed run.
pub async fn recover_stale_claims(
    pool: &SqlitePool,
    max_age_secs: u64,
    max_retries: u32,
) -> Result<usize, PipelineError> {
    let cutoff = Utc::now().timestamp() - max_age_secs as i64;
    let stale: Vec<String> = sqlx::query_scalar(
        "SELECT version_id FROM processing_records \
         WHERE status = 'processing' AND last_attempt_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut recovered = 0;
    for version_id in stale {
        let expired =
            fail_with(pool, &version_id, "claim expired", 1, max_retries, stage::EXPIRE).await;
        match expired {
            Ok(_) => recovered += 1,
            // Finished between the select and the update.
            Err(PipelineError::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    if recovered > 0 {
        warn!(recovered, "expired stale claims");
    }
    Ok(recovered)
}

/// A version that a retry sweep may claim now.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryCandidate {
    pub version_id: String,
    pub identity: String,
    pub retry_count: i64,
}

pub async fn due_for_retry(
    pool: &SqlitePool,
    policy: &RetryPolicy,
) -> Result<Vec<RetryCandidate>, PipelineError> {
    let cutoff = Utc::now().timestamp() - policy.retry_delay_secs as i64;
    let rows = sqlx::query_as::<_, RetryCandidate>(
        "SELECT p.version_id, d.identity, p.retry_count \
         FROM processing_records p JOIN tracked_documents d ON d.id = p.version_id \
         WHERE p.status = 'failed' AND p.retry_count < ? AND d.is_latest = 1 \
           AND (p.last_attempt_at IS NULL OR p.last_attempt_at <= ?) \
         ORDER BY p.last_attempt_at",
    )
    .bind(policy.max_retries as i64)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
