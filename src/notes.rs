// src/notes.rs
//
// AI-summarized meeting notes.
//
// The session hands the accumulated chat transcript to a `Summarizer` and
// replaces its digest wholesale with the result.  The HTTP implementation
// talks to any OpenAI-compatible chat-completions endpoint and asks for a
// JSON object back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::chat::{render_transcript, ChatMessage};
use crate::config::Config;
use crate::error::{CallError, CallResult};

const SYSTEM_PROMPT: &str = "You take notes for a video call. Read the chat transcript and \
reply with a JSON object with exactly these keys: \"summary\" (a short paragraph), \
\"keyPoints\" (array of strings) and \"actionItems\" (array of strings). \
Use empty arrays when there is nothing to report.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesDigest {
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "key_points")]
    pub key_points: Vec<String>,
    #[serde(default, alias = "action_items")]
    pub action_items: Vec<String>,
}

/// One request/response call per digest; no state between calls.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &[ChatMessage]) -> CallResult<NotesDigest>;
}

/// Build the summarizer selected by the configuration.
pub fn from_config(config: &Config) -> CallResult<Arc<dyn Summarizer>> {
    if !config.summarizer_enabled() {
        return Ok(Arc::new(UnconfiguredSummarizer));
    }
    let summarizer = HttpSummarizer::new(
        &config.summarizer_url,
        &config.summarizer_api_key,
        &config.summarizer_model,
        config.summarizer_timeout,
    )?;
    Ok(Arc::new(summarizer))
}

// ---------------------------------------------------------------------------
// HttpSummarizer
// ---------------------------------------------------------------------------

pub struct HttpSummarizer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpSummarizer {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> CallResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::SummarizationFailed(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, transcript: &[ChatMessage]) -> CallResult<NotesDigest> {
        if transcript.is_empty() {
            return Err(CallError::SummarizationFailed("transcript is empty".into()));
        }

        let body = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": render_transcript(transcript) },
            ],
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        debug!(endpoint = %self.endpoint, lines = transcript.len(), "requesting notes digest");
        let resp = request.send().await.map_err(|e| {
            warn!(endpoint = %self.endpoint, error = %e, "summarizer request failed");
            CallError::SummarizationFailed(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(endpoint = %self.endpoint, status = status.as_u16(), "summarizer returned an error");
            return Err(CallError::SummarizationFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 200)
            )));
        }

        let completion: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CallError::SummarizationFailed(format!("invalid response body: {e}")))?;
        let content = completion
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| CallError::SummarizationFailed("response has no message content".into()))?;

        let digest = parse_digest(content)?;
        info!(
            key_points = digest.key_points.len(),
            action_items = digest.action_items.len(),
            "notes digest generated"
        );
        Ok(digest)
    }
}

/// Used when no summarizer endpoint is configured.
pub struct UnconfiguredSummarizer;

#[async_trait]
impl Summarizer for UnconfiguredSummarizer {
    async fn summarize(&self, _transcript: &[ChatMessage]) -> CallResult<NotesDigest> {
        Err(CallError::SummarizationFailed(
            "no summarizer configured (set MESHCALL_SUMMARIZER_URL)".into(),
        ))
    }
}

/// Parse model output into a digest.  Accepts bare JSON or JSON inside a
/// markdown code fence.
pub fn parse_digest(content: &str) -> CallResult<NotesDigest> {
    let trimmed = strip_fence(content.trim());
    let digest: NotesDigest = serde_json::from_str(trimmed)
        .map_err(|e| CallError::SummarizationFailed(format!("unparseable digest: {e}")))?;
    if digest.summary.is_empty() && digest.key_points.is_empty() && digest.action_items.is_empty() {
        return Err(CallError::SummarizationFailed("digest is empty".into()));
    }
    Ok(digest)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
