//! Business entity persistence.
//!
//! Tenders are keyed by reference number, never by document identity, so
//! any number of documents and versions that name the same reference land
//! on one row. Child lists are keyed on (tender, description) and inserted
//! with `ON CONFLICT DO NOTHING`, which makes the whole persist stage safe
//! to re-run.

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::PipelineError;
use crate::models::{Chunk, ExtractedItem, Tender, TenderMetadata};

/// Counts from one persist run. `*_added` excludes suppressed duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistSummary {
    pub tender_id: String,
    pub reference_number: String,
    pub criteria_added: u64,
    pub documents_added: u64,
}

/// Upsert the tender and insert its child lists in one transaction.
pub async fn persist_entities(
    pool: &SqlitePool,
    version_id: &str,
    reference_number: &str,
    metadata: &TenderMetadata,
    criteria: &[ExtractedItem],
    documents: &[ExtractedItem],
) -> Result<PersistSummary, PipelineError> {
    let mut tx = pool.begin().await?;

    let tender_id = upsert_tender(&mut *tx, reference_number, metadata).await?;
    let criteria_added = insert_items(
        &mut *tx,
        "tender_qualification_criteria",
        &tender_id,
        version_id,
        criteria,
    )
    .await?;
    let documents_added = insert_items(
        &mut *tx,
        "tender_required_documents",
        &tender_id,
        version_id,
        documents,
    )
    .await?;

    tx.commit().await?;

    Ok(PersistSummary {
        tender_id,
        reference_number: reference_number.to_string(),
        criteria_added,
        documents_added,
    })
}

/// Insert or merge a tender. Present values win over nulls; among present
/// values the latest write wins.
async fn upsert_tender(
    conn: &mut SqliteConnection,
    reference_number: &str,
    m: &TenderMetadata,
) -> Result<String, PipelineError> {
    let now = Utc::now().timestamp();
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO tenders (id, reference_number, title, issuing_authority, submission_deadline,
                             clarification_deadline, site_location, contract_type, estimated_value,
                             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(reference_number) DO UPDATE SET
            title = COALESCE(excluded.title, tenders.title),
            issuing_authority = COALESCE(excluded.issuing_authority, tenders.issuing_authority),
            submission_deadline = COALESCE(excluded.submission_deadline, tenders.submission_deadline),
            clarification_deadline = COALESCE(excluded.clarification_deadline, tenders.clarification_deadline),
            site_location = COALESCE(excluded.site_location, tenders.site_location),
            contract_type = COALESCE(excluded.contract_type, tenders.contract_type),
            estimated_value = COALESCE(excluded.estimated_value, tenders.estimated_value),
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(reference_number)
    .bind(m.title.as_deref())
    .bind(m.issuing_authority.as_deref())
    .bind(m.submission_deadline.as_deref())
    .bind(m.clarification_deadline.as_deref())
    .bind(m.site_location.as_deref())
    .bind(m.contract_type.as_deref())
    .bind(m.estimated_value.as_deref())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_items(
    conn: &mut SqliteConnection,
    table: &str,
    tender_id: &str,
    version_id: &str,
    items: &[ExtractedItem],
) -> Result<u64, PipelineError> {
    let now = Utc::now().timestamp();
    let sql = format!(
        "INSERT INTO {} (id, tender_id, category, description, is_mandatory, source_version_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(tender_id, description) DO NOTHING",
        table
    );

    let mut added = 0;
    for item in items {
        added += sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(tender_id)
            .bind(&item.category)
            .bind(&item.description)
            .bind(item.mandatory)
            .bind(version_id)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(added)
}

/// Replace a version's chunks. Re-running for the same version leaves the
/// same rows behind.
pub async fn replace_chunks(
    pool: &SqlitePool,
    version_id: &str,
    tender_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    model: &str,
) -> Result<usize, PipelineError> {
    if chunks.len() != vectors.len() {
        return Err(PipelineError::Validation(format!(
            "{} chunks but {} vectors",
            chunks.len(),
            vectors.len()
        )));
    }

    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM tender_chunks WHERE version_id = ?")
        .bind(version_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors) {
        sqlx::query(
            "INSERT INTO tender_chunks \
             (id, version_id, tender_id, chunk_index, text, hash, model, dims, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id)
        .bind(tender_id)
        .bind(chunk.index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(chunks.len())
}

pub async fn get_tender(
    pool: &SqlitePool,
    reference_number: &str,
) -> Result<Option<Tender>, PipelineError> {
    let row = sqlx::query_as::<_, Tender>(
        "SELECT id, reference_number, title, issuing_authority, submission_deadline, \
                clarification_deadline, site_location, contract_type, estimated_value, \
                created_at, updated_at \
         FROM tenders WHERE reference_number = ?",
    )
    .bind(reference_number)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Child list rows for a tender, ordered by category then description.
pub async fn list_items(
    pool: &SqlitePool,
    tender_id: &str,
    table: ItemTable,
) -> Result<Vec<ExtractedItem>, PipelineError> {
    let rows = sqlx::query(&format!(
        "SELECT category, description, is_mandatory FROM {} \
         WHERE tender_id = ? ORDER BY category, description",
        table.name()
    ))
    .bind(tender_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ExtractedItem {
            category: row.get("category"),
            description: row.get("description"),
            mandatory: row.get("is_mandatory"),
        })
        .collect())
}

#[derive(Debug, Clone, Copy)]
pub enum ItemTable {
    Criteria,
    RequiredDocuments,
}

impl ItemTable {
    fn name(&self) -> &'static str {
        match self {
            ItemTable::Criteria => "tender_qualification_criteria",
            ItemTable::RequiredDocuments => "tender_required_documents",
        }
    }
}

/// A stored chunk with its decoded vector.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub version_id: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Chunks of the latest versions that resolved to this tender.
pub async fn latest_chunks_for_tender(
    pool: &SqlitePool,
    tender_id: &str,
) -> Result<Vec<StoredChunk>, PipelineError> {
    let rows = sqlx::query(
        "SELECT c.version_id, d.name, c.chunk_index, c.text, c.embedding \
         FROM tender_chunks c JOIN tracked_documents d ON d.id = c.version_id \
         WHERE c.tender_id = ? AND d.is_latest = 1 \
         ORDER BY d.name, c.chunk_index",
    )
    .bind(tender_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            StoredChunk {
                version_id: row.get("version_id"),
                document_name: row.get("name"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                vector: blob_to_vec(&blob),
            }
        })
        .collect())
}
