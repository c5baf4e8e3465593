//! LLM-backed structured extraction.
//!
//! [`LlmExtractor`] sends a prompt to an OpenAI-compatible chat completions
//! endpoint and parses the reply as JSON. Replies are never trusted: fences
//! are stripped with [`clean_json_response`] and anything that does not
//! deserialize becomes [`StructuredError::Malformed`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::error::StructuredError;
use crate::models::{ExtractedItem, ListKind, TenderMetadata};
use crate::traits::StructuredExtractor;

pub const METADATA_SYSTEM_PROMPT: &str =
    "You are a tender document analyzer. Return valid JSON only.";

pub const METADATA_PROMPT: &str = r#"Extract tender information from this document.

Required fields:
- reference_number: Tender reference/ID
- title: Short title of the works or services
- issuing_authority: Organization issuing the tender
- submission_deadline: Deadline date/time
- clarification_deadline: Last date for clarifications
- site_location: Project location
- contract_type: Contract type (lump sum, remeasurement, etc.)
- estimated_value: Estimated contract value if stated

Return ONLY a JSON object. Use null for missing fields.

Document:
{content}"#;

pub const CRITERIA_PROMPT: &str = r#"Extract ALL eligibility and qualification criteria.

Focus on:
- License requirements (grades, registrations)
- Financial requirements (turnover, capital)
- Experience requirements (projects, years)
- Technical requirements (equipment, manpower)

Return a JSON array:
[{"category": "license|financial|experience|technical", "description": "...", "mandatory": true}]
Return [] if there are none.

Document:
{content}"#;

pub const REQUIRED_DOCUMENTS_PROMPT: &str = r#"Extract the list of documents a bidder must submit.

Return a JSON array:
[{"category": "document", "description": "document name", "mandatory": true}]
Return [] if there are none.

Document:
{content}"#;

const LIST_SYSTEM_PROMPT: &str = "You are a tender analyzer. Return a valid JSON array only.";

pub const ANSWER_SYSTEM_PROMPT: &str = "You are a tender document Q&A assistant.";

pub const ANSWER_PROMPT: &str = r#"Answer the question based on the tender document context below.

Context:
{context}

Question: {question}

Provide a clear, accurate answer. If unsure, say so."#;

/// Fill [`ANSWER_PROMPT`]. `{context}` precedes the question in the
/// template, so a question containing that placeholder is left intact.
pub fn answer_prompt(question: &str, context: &str) -> String {
    ANSWER_PROMPT
        .replacen("{question}", question, 1)
        .replacen("{context}", context, 1)
}

/// Strip markdown code fences around a JSON reply.
pub fn clean_json_response(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parse a cleaned reply, reporting failures as `Malformed`.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, StructuredError> {
    serde_json::from_str(clean_json_response(raw))
        .map_err(|e| StructuredError::Malformed(format!("{} in reply: {}", e, preview(raw))))
}

/// Parse a metadata reply. A JSON `null` means the model found nothing.
pub fn parse_metadata(raw: &str) -> Result<Option<TenderMetadata>, StructuredError> {
    let meta: Option<TenderMetadata> = parse_reply(raw)?;
    Ok(meta.map(normalise_metadata))
}

/// Parse a list reply, dropping items with blank descriptions.
pub fn parse_items(raw: &str) -> Result<Vec<ExtractedItem>, StructuredError> {
    let items: Option<Vec<ExtractedItem>> = parse_reply(raw)?;
    Ok(items
        .unwrap_or_default()
        .into_iter()
        .filter_map(|mut item| {
            item.description = item.description.trim().to_string();
            item.category = item.category.trim().to_lowercase();
            (!item.description.is_empty()).then_some(item)
        })
        .collect())
}

fn normalise_metadata(mut meta: TenderMetadata) -> TenderMetadata {
    for field in [
        &mut meta.reference_number,
        &mut meta.title,
        &mut meta.issuing_authority,
        &mut meta.submission_deadline,
        &mut meta.clarification_deadline,
        &mut meta.site_location,
        &mut meta.contract_type,
        &mut meta.estimated_value,
    ] {
        if let Some(value) = field.take() {
            let trimmed = value.trim();
            if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("null") {
                *field = Some(trimmed.to_string());
            }
        }
    }
    meta
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Chat-completions client for structured extraction.
pub struct LlmExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
    metadata_chars: usize,
    list_chars: usize,
}

impl LlmExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.model required for OpenAI provider"))?;
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) => bail!("{} environment variable not set", config.api_key_env),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_retries: config.max_retries,
            metadata_chars: config.metadata_chars,
            list_chars: config.list_chars,
        })
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, StructuredError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
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
                            .map_err(|e| StructuredError::Malformed(e.to_string()))?;
                        return json
                            .pointer("/choices/0/message/content")
                            .and_then(|c| c.as_str())
                            .map(|c| c.to_string())
                            .ok_or_else(|| {
                                StructuredError::Malformed("reply has no message content".into())
                            });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = %status, attempt, "extraction request failed, retrying");
                        last_err = Some(StructuredError::Transport(format!(
                            "chat API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }
                    return Err(StructuredError::Malformed(format!(
                        "chat API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(StructuredError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| StructuredError::Transport("extraction failed after retries".into())))
    }
}

#[async_trait]
impl StructuredExtractor for LlmExtractor {
    async fn extract_metadata(
        &self,
        text: &str,
    ) -> Result<Option<TenderMetadata>, StructuredError> {
        let prompt =
            METADATA_PROMPT.replace("{content}", truncate_chars(text, self.metadata_chars));
        let reply = self.complete(METADATA_SYSTEM_PROMPT, prompt).await?;
        debug!(chars = reply.len(), "metadata reply received");
        parse_metadata(&reply)
    }

    async fn extract_list(
        &self,
        text: &str,
        kind: ListKind,
    ) -> Result<Vec<ExtractedItem>, StructuredError> {
        let template = match kind {
            ListKind::QualificationCriteria => CRITERIA_PROMPT,
            ListKind::RequiredDocuments => REQUIRED_DOCUMENTS_PROMPT,
        };
        let prompt = template.replace("{content}", truncate_chars(text, self.list_chars));
        let reply = self.complete(LIST_SYSTEM_PROMPT, prompt).await?;
        debug!(kind = kind.as_str(), chars = reply.len(), "list reply received");
        parse_items(&reply)
    }

    async fn answer(&self, question: &str, context: &str) -> Result<String, StructuredError> {
        let reply = self
            .complete(ANSWER_SYSTEM_PROMPT, answer_prompt(question, context))
            .await?;
        Ok(reply.trim().to_string())
    }
}

/// Extractor used when `extraction.provider = "disabled"`; every call fails.
pub struct DisabledExtractor;

#[async_trait]
impl StructuredExtractor for DisabledExtractor {
    async fn extract_metadata(
        &self,
        _text: &str,
    ) -> Result<Option<TenderMetadata>, StructuredError> {
        Err(StructuredError::Disabled)
    }

    async fn extract_list(
        &self,
        _text: &str,
        _kind: ListKind,
    ) -> Result<Vec<ExtractedItem>, StructuredError> {
        Err(StructuredError::Disabled)
    }
}

pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn StructuredExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledExtractor)),
        "openai" => Ok(Arc::new(LlmExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}
