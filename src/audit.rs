//! Append-only audit log.
//!
//! One row per stage attempt or state transition. Rows are only ever
//! inserted; nothing in the crate updates or deletes them.

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool};

use crate::error::PipelineError;
use crate::models::{AuditLogEntry, StageOutcome};

/// Stage and transition names written to `audit_log.stage`.
pub mod stage {
    pub const DISCOVER: &str = "discover";
    pub const CLAIM: &str = "claim";
    pub const FETCH: &str = "fetch";
    pub const EXTRACT_TEXT: &str = "extract_text";
    pub const EXTRACT_STRUCTURED: &str = "extract_structured";
    pub const PERSIST: &str = "persist_entities";
    pub const CHUNK_EMBED: &str = "chunk_embed";
    pub const COMPLETE: &str = "complete";
    pub const FAIL: &str = "fail";
    pub const RESET: &str = "reset";
    pub const EXPIRE: &str = "expire";

    /// Pipeline stages in execution order.
    pub const PIPELINE: [&str; 5] = [FETCH, EXTRACT_TEXT, EXTRACT_STRUCTURED, PERSIST, CHUNK_EMBED];
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A single entry ready to append.
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub version_id: &'a str,
    pub stage: &'a str,
    pub outcome: StageOutcome,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub detail: Option<String>,
}

impl<'a> NewAuditEntry<'a> {
    /// An instantaneous event (state transitions).
    pub fn event(
        version_id: &'a str,
        stage: &'a str,
        outcome: StageOutcome,
        detail: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            version_id,
            stage,
            outcome,
            started_at_ms: now,
            finished_at_ms: now,
            detail,
        }
    }
}

/// Append an entry using any executor, so transitions can log inside the
/// same transaction that changes state.
pub async fn append<'e, E>(executor: E, entry: &NewAuditEntry<'_>) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let duration = (entry.finished_at_ms - entry.started_at_ms).max(0);
    sqlx::query(
        "INSERT INTO audit_log \
         (version_id, stage, outcome, started_at_ms, finished_at_ms, duration_ms, detail) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.version_id)
    .bind(entry.stage)
    .bind(entry.outcome.as_str())
    .bind(entry.started_at_ms)
    .bind(entry.finished_at_ms)
    .bind(duration)
    .bind(entry.detail.as_deref())
    .execute(executor)
    .await?;
    Ok(())
}

/// Entries for one version, in insertion order.
pub async fn entries_for(
    pool: &SqlitePool,
    version_id: &str,
) -> Result<Vec<AuditLogEntry>, PipelineError> {
    let rows = sqlx::query_as::<_, AuditLogEntry>(
        "SELECT id, version_id, stage, outcome, started_at_ms, finished_at_ms, duration_ms, detail \
         FROM audit_log WHERE version_id = ? ORDER BY id",
    )
    .bind(version_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-stage aggregate for `stats`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StageSummary {
    pub stage: String,
    pub succeeded: i64,
    pub failed: i64,
    pub avg_duration_ms: f64,
}

pub async fn stage_summary(pool: &SqlitePool) -> Result<Vec<StageSummary>, PipelineError> {
    let rows = sqlx::query_as::<_, StageSummary>(
        "SELECT stage, \
                SUM(CASE WHEN outcome = 'succeeded' THEN 1 ELSE 0 END) AS succeeded, \
                SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END) AS failed, \
                CAST(COALESCE(AVG(duration_ms), 0) AS REAL) AS avg_duration_ms \
         FROM audit_log GROUP BY stage ORDER BY MIN(id)",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
