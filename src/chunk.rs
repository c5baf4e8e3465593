//! Overlapping word-window chunker.
//!
//! Splits extracted text into windows of `window_words` words, each
//! starting `window_words - overlap_words` words after the previous one.
//! Windows shorter than `min_chars` characters are discarded. Each chunk
//! carries a SHA-256 hash of its text.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Split text into overlapping word windows. Indices are contiguous from 0
/// over the windows that survive the length filter.
pub fn chunk_words(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || config.window_words == 0 {
        return Vec::new();
    }

    // Validated config guarantees overlap < window; clamp anyway so step >= 1.
    let step = config
        .window_words
        .saturating_sub(config.overlap_words)
        .max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + config.window_words).min(words.len());
        let window = words[start..end].join(" ");
        if window.chars().count() >= config.min_chars {
            chunks.push(make_chunk(chunks.len() as i64, window));
        }
        if end == words.len() {
            break;
        }
        start += step;
    }

    chunks
}

fn make_chunk(index: i64, text: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk { index, text, hash }
}
