//! Tender report: metadata, qualification criteria, and required documents.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::models::{ExtractedItem, Tender};
use crate::stats::format_ts_relative;
use crate::store::{self, ItemTable};

/// A tender together with its child lists and the documents that fed it.
#[derive(Debug, Clone)]
pub struct TenderReport {
    pub tender: Tender,
    pub criteria: Vec<ExtractedItem>,
    pub required_documents: Vec<ExtractedItem>,
    pub sources: Vec<SourceDocument>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceDocument {
    pub identity: String,
    pub name: String,
    pub version_number: i64,
    pub document_type: Option<String>,
    pub completed_at: Option<i64>,
}

pub async fn build_report(
    pool: &SqlitePool,
    reference_number: &str,
) -> Result<Option<TenderReport>, PipelineError> {
    let Some(tender) = store::get_tender(pool, reference_number).await? else {
        return Ok(None);
    };

    let criteria = store::list_items(pool, &tender.id, ItemTable::Criteria).await?;
    let required_documents =
        store::list_items(pool, &tender.id, ItemTable::RequiredDocuments).await?;

    let sources = sqlx::query_as::<_, SourceDocument>(
        "SELECT d.identity, d.name, d.version_number, p.document_type, p.completed_at \
         FROM processing_records p JOIN tracked_documents d ON d.id = p.version_id \
         WHERE p.tender_reference = ? AND p.status = 'completed' \
         ORDER BY d.identity, d.version_number DESC",
    )
    .bind(reference_number)
    .fetch_all(pool)
    .await?;

    Ok(Some(TenderReport {
        tender,
        criteria,
        required_documents,
        sources,
    }))
}

pub async fn run_report(config: &Config, reference_number: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = build_report(&pool, reference_number).await;
    pool.close().await;

    let Some(report) = report? else {
        bail!("tender not found: {}", reference_number);
    };
    let t = &report.tender;

    println!("Tender {}", t.reference_number);
    println!("{}", "=".repeat(7 + t.reference_number.len()));
    println!();
    print_field("Title", &t.title);
    print_field("Issuing authority", &t.issuing_authority);
    print_field("Submission deadline", &t.submission_deadline);
    print_field("Clarification deadline", &t.clarification_deadline);
    print_field("Site location", &t.site_location);
    print_field("Contract type", &t.contract_type);
    print_field("Estimated value", &t.estimated_value);
    println!("  {:<24} {}", "Last updated", format_ts_relative(t.updated_at));

    print_items("Qualification criteria", &report.criteria);
    print_items("Required documents", &report.required_documents);

    if !report.sources.is_empty() {
        println!();
        println!("  Source documents:");
        for s in &report.sources {
            println!(
                "    {} (v{}, {})",
                s.identity,
                s.version_number,
                s.document_type.as_deref().unwrap_or("other")
            );
        }
    }
    println!();
    Ok(())
}

fn print_field(label: &str, value: &Option<String>) {
    println!("  {:<24} {}", label, value.as_deref().unwrap_or("-"));
}

fn print_items(heading: &str, items: &[ExtractedItem]) {
    println!();
    println!("  {} ({}):", heading, items.len());
    if items.is_empty() {
        println!("    none found");
        return;
    }
    for item in items {
        println!(
            "    [{}] {}{}",
            item.category,
            item.description,
            if item.mandatory { "" } else { " (optional)" }
        );
    }
}
