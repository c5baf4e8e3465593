//! Chunk retrieval and question answering for `tender query`.
//!
//! Embeds the question with the configured embedding service and ranks the
//! stored chunks of one tender's latest document versions by cosine
//! similarity. With `--answer`, the top chunks become the context of a
//! prompt to the extraction model.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::PipelineError;
use crate::models::ChunkMatch;
use crate::store;
use crate::structured;
use crate::traits::{EmbeddingService, StructuredExtractor};

pub const DEFAULT_LIMIT: usize = 5;

pub const NO_CONTEXT_ANSWER: &str = "No relevant information found.";

/// A generated answer and the chunks it was generated from.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<ChunkMatch>,
}

/// Top `limit` chunks of the tender, best first. `None` if the tender is unknown.
pub async fn query_tender(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingService,
    reference_number: &str,
    question: &str,
    limit: usize,
) -> Result<Option<Vec<ChunkMatch>>, PipelineError> {
    let Some(tender) = store::get_tender(pool, reference_number).await? else {
        return Ok(None);
    };

    let query_vec = embedder
        .embed(&[question.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Validation("empty embedding response".into()))?;

    let chunks = store::latest_chunks_for_tender(pool, &tender.id).await?;
    Ok(Some(rank(&query_vec, chunks, limit)))
}

/// Answer `question` from the tender's top `limit` chunks. No model call is
/// made when nothing was retrieved. `None` if the tender is unknown.
pub async fn answer_question(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingService,
    extractor: &dyn StructuredExtractor,
    reference_number: &str,
    question: &str,
    limit: usize,
) -> Result<Option<Answer>, PipelineError> {
    let found = query_tender(pool, embedder, reference_number, question, limit).await?;
    let Some(sources) = found else {
        return Ok(None);
    };
    if sources.is_empty() {
        return Ok(Some(Answer {
            text: NO_CONTEXT_ANSWER.to_string(),
            sources,
        }));
    }

    let text = extractor.answer(question, &build_context(&sources)).await?;
    Ok(Some(Answer { text, sources }))
}

/// Each chunk headed by its document and position, separated by blank lines.
pub fn build_context(matches: &[ChunkMatch]) -> String {
    matches
        .iter()
        .map(|m| format!("[{}, chunk {}]\n{}", m.document_name, m.chunk_index, m.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn rank(query_vec: &[f32], chunks: Vec<store::StoredChunk>, limit: usize) -> Vec<ChunkMatch> {
    let mut matches: Vec<ChunkMatch> = chunks
        .into_iter()
        .map(|c| ChunkMatch {
            score: embedding::cosine_similarity(query_vec, &c.vector),
            version_id: c.version_id,
            document_name: c.document_name,
            chunk_index: c.chunk_index,
            text: c.text,
        })
        .collect();

    // Sort by similarity desc and take top K
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(limit);
    matches
}

pub async fn run_query(
    config: &Config,
    reference_number: &str,
    question: &str,
    limit: Option<usize>,
    answer: bool,
) -> Result<()> {
    if question.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if answer && config.extraction.provider == "disabled" {
        bail!("--answer needs an extraction provider (set [extraction] provider = \"openai\")");
    }

    let embedder = embedding::create_service(&config.embedding, &config.extraction)?;
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    let pool = db::connect(config).await?;

    if answer {
        let extractor = structured::create_extractor(&config.extraction)?;
        let result = answer_question(
            &pool,
            embedder.as_ref(),
            extractor.as_ref(),
            reference_number,
            question,
            limit,
        )
        .await;
        pool.close().await;

        let Some(answer) = result? else {
            bail!("tender not found: {}", reference_number);
        };
        println!("{}", answer.text);
        if !answer.sources.is_empty() {
            println!();
            println!("Sources:");
            print_matches(&answer.sources);
        }
        return Ok(());
    }

    let result = query_tender(&pool, embedder.as_ref(), reference_number, question, limit).await;
    pool.close().await;

    let Some(matches) = result? else {
        bail!("tender not found: {}", reference_number);
    };

    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print_matches(&matches);
    Ok(())
}

fn print_matches(matches: &[ChunkMatch]) {
    for (i, m) in matches.iter().enumerate() {
        let snippet: String = m.text.chars().take(240).collect();
        println!(
            "{}. [{:.2}] {} #{}",
            i + 1,
            m.score,
            m.document_name,
            m.chunk_index
        );
        println!("    {}", snippet.replace('\n', " "));
        println!();
    }
}
