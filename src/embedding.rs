//! Embedding services and vector utilities.
//!
//! Two [`EmbeddingService`] implementations:
//! - **[`HashEmbedder`]**: deterministic bag-of-words hashing, no network.
//!   The default; good enough for lexical retrieval and for tests.
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/embeddings`
//!   endpoint with batching, retry, and backoff.
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`],
//! [`blob_to_vec`]) and compared with [`cosine_similarity`].
//!
//! # Retry Strategy
//!
//! The OpenAI service retries HTTP 429, 5xx and network errors with
//! exponential backoff (1s, 2s, 4s, ... capped at 2^5). Other 4xx
//! responses fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, ExtractionConfig};
use crate::error::EmbedError;
use crate::traits::EmbeddingService;

// ============ Hash Embedder ============

/// Local embedder that hashes lowercase word tokens into `dims` buckets and
/// L2-normalises the result.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dims];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dims as u64) as usize;
            embedding[bucket] += 1.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }
}

// ============ OpenAI Embedder ============

/// Embedding service backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Build from config. The API key is read from the extraction section's
    /// `api_key_env` variable, shared by both remote services.
    pub fn new(config: &EmbeddingConfig, remote: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = match std::env::var(&remote.api_key_env) {
            Ok(key) => key,
            Err(_) => bail!("{} environment variable not set", remote.api_key_env),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: remote.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbedError::Malformed(e.to_string()))?;
                        return parse_openai_response(&json);
                    }

                    // Rate limited or server error, retry
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EmbedError::Transport(format!(
                            "embeddings API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(EmbedError::Malformed(format!(
                        "embeddings API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EmbedError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbedError::Transport("embedding failed after retries".into())))
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let vectors = self.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(EmbedError::LengthMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            check_dims(&vectors, self.dims)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Every vector must have the configured width.
fn check_dims(vectors: &[Vec<f32>], dims: usize) -> Result<(), EmbedError> {
    match vectors.iter().position(|v| v.len() != dims) {
        Some(i) => Err(EmbedError::Malformed(format!(
            "vector {} has {} dimensions, expected {}",
            i,
            vectors[i].len(),
            dims
        ))),
        None => Ok(()),
    }
}

/// Parse an embeddings response, ordering vectors by their `index` field.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Malformed("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Malformed("missing embedding".into()))?;

        let vec = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EmbedError::Malformed("non-numeric embedding value".into()))
            })
            .collect::<Result<Vec<f32>, _>>()?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the configured [`EmbeddingService`].
///
/// | Config Value | Service |
/// |-------------|---------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
pub fn create_service(
    config: &EmbeddingConfig,
    remote: &ExtractionConfig,
) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.effective_dims()))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config, remote)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
