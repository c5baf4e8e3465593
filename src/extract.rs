//! Text extraction for tender documents (PDF and plain text).
//!
//! PDF parsing is CPU-bound and runs on the blocking pool. Pages are joined
//! with `--- Page N ---` markers so downstream chunks keep page context.

use async_trait::async_trait;

use crate::error::ContentError;
use crate::traits::{ContentExtractor, ExtractedText};

const PDF_MAGIC: &[u8] = b"%PDF";

/// Default [`ContentExtractor`]: PDFs via `pdf-extract`, everything else
/// must be valid UTF-8 text.
#[derive(Debug, Default, Clone)]
pub struct DocumentTextExtractor;

impl DocumentTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContentExtractor for DocumentTextExtractor {
    async fn extract(&self, bytes: Vec<u8>, name: &str) -> Result<ExtractedText, ContentError> {
        if looks_like_pdf(&bytes, name) {
            let name = name.to_string();
            tokio::task::spawn_blocking(move || extract_pdf(&bytes))
                .await
                .map_err(|e| ContentError::Corrupt(format!("{}: PDF parser aborted: {}", name, e)))?
        } else {
            extract_plain(&bytes)
        }
    }
}

fn looks_like_pdf(bytes: &[u8], name: &str) -> bool {
    bytes.starts_with(PDF_MAGIC) || name.to_ascii_lowercase().ends_with(".pdf")
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ContentError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ContentError::Corrupt(e.to_string()))?;
    Ok(join_pages(&pages))
}

fn extract_plain(bytes: &[u8]) -> Result<ExtractedText, ContentError> {
    if bytes.contains(&0) {
        return Err(ContentError::Unsupported(
            "binary content that is not a PDF".to_string(),
        ));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ContentError::Corrupt(format!("invalid UTF-8: {}", e)))?;
    Ok(ExtractedText {
        text: text.to_string(),
        page_count: 1,
    })
}

/// Join per-page text with page markers. Blank pages still count.
pub fn join_pages(pages: &[String]) -> ExtractedText {
    let mut text = String::new();
    for (i, page) in pages.iter().enumerate() {
        let trimmed = page.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("\n--- Page {} ---\n", i + 1));
        text.push_str(trimmed);
    }
    ExtractedText {
        text,
        page_count: pages.len(),
    }
}
