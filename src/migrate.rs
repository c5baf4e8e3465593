use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index the pipeline owns. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per (identity, fingerprint) pair
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracked_documents (
            id TEXT PRIMARY KEY,
            identity TEXT NOT NULL,
            name TEXT NOT NULL,
            path TEXT,
            fingerprint TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            source_modified_at INTEGER,
            version_number INTEGER NOT NULL,
            is_latest INTEGER NOT NULL DEFAULT 1,
            previous_version_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(identity, fingerprint),
            FOREIGN KEY (previous_version_id) REFERENCES tracked_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The at-most-one-latest guarantee lives in the store, not in callers.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tracked_one_latest \
         ON tracked_documents(identity) WHERE is_latest = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_records (
            version_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_attempt_at INTEGER,
            completed_at INTEGER,
            tender_reference TEXT,
            document_type TEXT,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (version_id) REFERENCES tracked_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            outcome TEXT NOT NULL,
            started_at_ms INTEGER NOT NULL,
            finished_at_ms INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            detail TEXT,
            FOREIGN KEY (version_id) REFERENCES tracked_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenders (
            id TEXT PRIMARY KEY,
            reference_number TEXT NOT NULL UNIQUE,
            title TEXT,
            issuing_authority TEXT,
            submission_deadline TEXT,
            clarification_deadline TEXT,
            site_location TEXT,
            contract_type TEXT,
            estimated_value TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tender_qualification_criteria (
            id TEXT PRIMARY KEY,
            tender_id TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT NOT NULL,
            is_mandatory INTEGER NOT NULL DEFAULT 1,
            source_version_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(tender_id, description),
            FOREIGN KEY (tender_id) REFERENCES tenders(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tender_required_documents (
            id TEXT PRIMARY KEY,
            tender_id TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT NOT NULL,
            is_mandatory INTEGER NOT NULL DEFAULT 1,
            source_version_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(tender_id, description),
            FOREIGN KEY (tender_id) REFERENCES tenders(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tender_chunks (
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            tender_id TEXT,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(version_id, chunk_index),
            FOREIGN KEY (version_id) REFERENCES tracked_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracked_identity ON tracked_documents(identity)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processing_status ON processing_records(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_version ON audit_log(version_id, id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tender ON tender_chunks(tender_id)")
        .execute(pool)
        .await?;

    Ok(())
}
