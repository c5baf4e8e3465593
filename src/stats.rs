//! Pipeline statistics and per-document status.
//!
//! `tender stats` summarises the whole store: versions by effective status
//! (exhausted apart from retryable failures), tender counts, per-stage
//! audit aggregates and recent completions. `tender status <identity>`
//! shows one document's version lineage and audit trail.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::audit::{self, StageSummary};
use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::ledger;
use crate::state::{self, effective_status};

#[derive(Debug, Clone)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
    pub avg_retries: f64,
}

#[derive(Debug, Clone)]
pub struct RecentCompletion {
    pub identity: String,
    pub name: String,
    pub version_number: i64,
    pub tender_reference: Option<String>,
    pub completed_at: i64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub documents: i64,
    pub versions: i64,
    pub by_status: Vec<StatusCount>,
    pub tenders: i64,
    pub criteria: i64,
    pub required_documents: i64,
    pub chunks: i64,
    pub stages: Vec<StageSummary>,
    pub recent: Vec<RecentCompletion>,
}

impl StatsSnapshot {
    pub fn count_for(&self, status: &str) -> i64 {
        self.by_status
            .iter()
            .find(|s| s.status == status)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

pub async fn collect_stats(
    pool: &SqlitePool,
    max_retries: u32,
) -> Result<StatsSnapshot, PipelineError> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT identity) FROM tracked_documents")
        .fetch_one(pool)
        .await?;
    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracked_documents")
        .fetch_one(pool)
        .await?;

    let status_rows = sqlx::query(
        r#"
        SELECT
            CASE WHEN status = 'failed' AND retry_count >= ? THEN 'exhausted' ELSE status END AS effective,
            COUNT(*) AS n,
            CAST(AVG(retry_count) AS REAL) AS avg_retries
        FROM processing_records
        GROUP BY effective
        ORDER BY effective
        "#,
    )
    .bind(max_retries as i64)
    .fetch_all(pool)
    .await?;

    let by_status = status_rows
        .iter()
        .map(|row| StatusCount {
            status: row.get("effective"),
            count: row.get("n"),
            avg_retries: row.get::<Option<f64>, _>("avg_retries").unwrap_or(0.0),
        })
        .collect();

    let tenders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
        .fetch_one(pool)
        .await?;
    let criteria: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tender_qualification_criteria")
        .fetch_one(pool)
        .await?;
    let required_documents: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tender_required_documents")
            .fetch_one(pool)
            .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tender_chunks")
        .fetch_one(pool)
        .await?;

    let stages = audit::stage_summary(pool).await?;

    let recent_rows = sqlx::query(
        r#"
        SELECT d.identity, d.name, d.version_number, p.tender_reference, p.completed_at
        FROM processing_records p
        JOIN tracked_documents d ON d.id = p.version_id
        WHERE p.status = 'completed'
        ORDER BY p.completed_at DESC
        LIMIT 10
        "#,
    )
    .fetch_all(pool)
    .await?;

    let recent = recent_rows
        .iter()
        .map(|row| RecentCompletion {
            identity: row.get("identity"),
            name: row.get("name"),
            version_number: row.get("version_number"),
            tender_reference: row.get("tender_reference"),
            completed_at: row.get::<Option<i64>, _>("completed_at").unwrap_or(0),
        })
        .collect();

    Ok(StatsSnapshot {
        documents,
        versions,
        by_status,
        tenders,
        criteria,
        required_documents,
        chunks,
        stages,
        recent,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool, config.processing.max_retries).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Tender Intake: Pipeline Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Versions:    {}", stats.versions);
    println!("  Tenders:     {}", stats.tenders);
    println!("  Criteria:    {}", stats.criteria);
    println!("  Req. docs:   {}", stats.required_documents);
    println!("  Chunks:      {}", stats.chunks);

    if !stats.by_status.is_empty() {
        println!();
        println!("  By status:");
        println!("  {:<12} {:>6} {:>12}", "STATUS", "COUNT", "AVG RETRIES");
        println!("  {}", "-".repeat(32));
        for s in &stats.by_status {
            println!("  {:<12} {:>6} {:>12.2}", s.status, s.count, s.avg_retries);
        }
    }

    if !stats.stages.is_empty() {
        println!();
        println!("  By stage:");
        println!(
            "  {:<20} {:>6} {:>6} {:>10}",
            "STAGE", "OK", "FAILED", "AVG MS"
        );
        println!("  {}", "-".repeat(46));
        for s in &stats.stages {
            println!(
                "  {:<20} {:>6} {:>6} {:>10.0}",
                s.stage, s.succeeded, s.failed, s.avg_duration_ms
            );
        }
    }

    if !stats.recent.is_empty() {
        println!();
        println!("  Recently completed:");
        for r in &stats.recent {
            println!(
                "  {:<40} v{:<3} {:<16} {}",
                r.identity,
                r.version_number,
                r.tender_reference.as_deref().unwrap_or("-"),
                format_ts_relative(r.completed_at)
            );
        }
    }

    println!();
    Ok(())
}

/// Print the lineage and audit trail of one document.
pub async fn run_status(config: &Config, identity: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let max = config.processing.max_retries;

    let versions = ledger::lineage(&pool, identity).await?;
    if versions.is_empty() {
        pool.close().await;
        bail!("document not found: {}", identity);
    }

    println!("{}", identity);
    for v in &versions {
        let record = state::get_record(&pool, &v.id).await?;
        let (status, retries, error, tender, doc_type) = match &record {
            Some(r) => (
                effective_status(r.status(), r.retry_count.max(0) as u32, max)
                    .as_str()
                    .to_string(),
                r.retry_count,
                r.last_error.clone(),
                r.tender_reference.clone(),
                r.document_type.clone(),
            ),
            None => ("unknown".to_string(), 0, None, None, None),
        };

        println!();
        println!(
            "  v{} {}{}",
            v.version_number,
            v.id,
            if v.is_latest { " (latest)" } else { "" }
        );
        println!("    name:        {}", v.name);
        println!("    fingerprint: {}", v.fingerprint);
        println!("    size:        {}", format_bytes(v.size_bytes.max(0) as u64));
        println!("    seen:        {}", format_ts_relative(v.created_at));
        println!("    status:      {} ({}/{} attempts)", status, retries, max);
        if let Some(t) = tender {
            println!("    tender:      {}", t);
        }
        if let Some(d) = doc_type {
            println!("    type:        {}", d);
        }
        if let Some(e) = error {
            println!("    last error:  {}", e);
        }

        let entries = audit::entries_for(&pool, &v.id).await?;
        if !entries.is_empty() {
            println!("    audit:");
            for e in &entries {
                println!(
                    "      {} {:<20} {:<10} {:>6} ms  {}",
                    format_ts_iso(e.started_at_ms / 1000),
                    e.stage,
                    e.outcome,
                    e.duration_ms,
                    e.detail.as_deref().unwrap_or("")
                );
            }
        }
    }

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
