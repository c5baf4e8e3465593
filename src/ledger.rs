//! Version ledger: the lineage of content versions per external identity.
//!
//! [`record_version`] is the serialization point for concurrent scans. It
//! runs in one transaction that takes the database write lock first, so two
//! recorders for the same identity queue instead of interleaving. The
//! partial unique index on `is_latest` backs the at-most-one-latest rule at
//! the storage level as well.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{self, stage, NewAuditEntry};
use crate::error::PipelineError;
use crate::models::{StageOutcome, TrackedDocument, VersionMetadata};

const SELECT_DOCUMENT: &str = "SELECT id, identity, name, path, fingerprint, size_bytes, \
     source_modified_at, version_number, is_latest, previous_version_id, created_at \
     FROM tracked_documents";

/// Record an observed (identity, fingerprint) and return its version id.
///
/// Recording a pair that already exists is a no-op returning the existing
/// id. Otherwise the caller's `previous` must still be the identity's
/// latest version; if another writer advanced it, this returns
/// [`PipelineError::Conflict`] and the caller should classify again.
pub async fn record_version(
    pool: &SqlitePool,
    identity: &str,
    fingerprint: &str,
    metadata: &VersionMetadata,
    previous: Option<&str>,
) -> Result<String, PipelineError> {
    match record_version_tx(pool, identity, fingerprint, metadata, previous).await {
        Err(PipelineError::Store(sqlx::Error::Database(db))) if db.is_unique_violation() => {
            // Lost a race the lock did not cover; resolve like a duplicate.
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM tracked_documents WHERE identity = ? AND fingerprint = ?",
            )
            .bind(identity)
            .bind(fingerprint)
            .fetch_optional(pool)
            .await?;
            existing.ok_or_else(|| PipelineError::Conflict {
                identity: identity.to_string(),
                detail: format!("concurrent writer: {}", db.message()),
            })
        }
        other => other,
    }
}

async fn record_version_tx(
    pool: &SqlitePool,
    identity: &str,
    fingerprint: &str,
    metadata: &VersionMetadata,
    previous: Option<&str>,
) -> Result<String, PipelineError> {
    let mut tx = pool.begin().await?;

    // First statement writes, so the transaction holds the write lock
    // before it reads anything.
    sqlx::query("UPDATE tracked_documents SET is_latest = is_latest WHERE identity = ? AND is_latest = 1")
        .bind(identity)
        .execute(&mut *tx)
        .await?;

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM tracked_documents WHERE identity = ? AND fingerprint = ?",
    )
    .bind(identity)
    .bind(fingerprint)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(id) = existing {
        tx.commit().await?;
        debug!(identity, version_id = %id, "version already recorded");
        return Ok(id);
    }

    let latest: Option<(String, i64)> = sqlx::query_as(
        "SELECT id, version_number FROM tracked_documents WHERE identity = ? AND is_latest = 1",
    )
    .bind(identity)
    .fetch_optional(&mut *tx)
    .await?;

    let latest_id = latest.as_ref().map(|(id, _)| id.as_str());
    if latest_id != previous {
        return Err(PipelineError::Conflict {
            identity: identity.to_string(),
            detail: format!(
                "latest version is {} but caller expected {}",
                latest_id.unwrap_or("none"),
                previous.unwrap_or("none")
            ),
        });
    }

    if let Some((prev_id, _)) = &latest {
        let demoted = sqlx::query(
            "UPDATE tracked_documents SET is_latest = 0 WHERE id = ? AND is_latest = 1",
        )
        .bind(prev_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if demoted != 1 {
            return Err(PipelineError::Conflict {
                identity: identity.to_string(),
                detail: format!("version {} was demoted concurrently", prev_id),
            });
        }
    }

    let max_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version_number) FROM tracked_documents WHERE identity = ?")
            .bind(identity)
            .fetch_one(&mut *tx)
            .await?;
    let version_number = max_version.unwrap_or(0) + 1;

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO tracked_documents \
         (id, identity, name, path, fingerprint, size_bytes, source_modified_at, \
          version_number, is_latest, previous_version_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(identity)
    .bind(&metadata.name)
    .bind(metadata.path.as_deref())
    .bind(fingerprint)
    .bind(metadata.size_bytes)
    .bind(metadata.source_modified_at)
    .bind(version_number)
    .bind(latest_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO processing_records (version_id, status, retry_count, updated_at) \
         VALUES (?, 'pending', 0, ?)",
    )
    .bind(&id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    audit::append(
        &mut *tx,
        &NewAuditEntry::event(
            &id,
            stage::DISCOVER,
            StageOutcome::Succeeded,
            Some(format!("version {} of {}", version_number, identity)),
        ),
    )
    .await?;

    tx.commit().await?;

    info!(identity, version_id = %id, version_number, "recorded new version");
    Ok(id)
}

pub async fn get_version(
    pool: &SqlitePool,
    version_id: &str,
) -> Result<Option<TrackedDocument>, PipelineError> {
    let row = sqlx::query_as::<_, TrackedDocument>(&format!("{} WHERE id = ?", SELECT_DOCUMENT))
        .bind(version_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn latest_version(
    pool: &SqlitePool,
    identity: &str,
) -> Result<Option<TrackedDocument>, PipelineError> {
    let row = sqlx::query_as::<_, TrackedDocument>(&format!(
        "{} WHERE identity = ? AND is_latest = 1",
        SELECT_DOCUMENT
    ))
    .bind(identity)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// All versions of an identity, newest first.
pub async fn lineage(
    pool: &SqlitePool,
    identity: &str,
) -> Result<Vec<TrackedDocument>, PipelineError> {
    let rows = sqlx::query_as::<_, TrackedDocument>(&format!(
        "{} WHERE identity = ? ORDER BY version_number DESC",
        SELECT_DOCUMENT
    ))
    .bind(identity)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
