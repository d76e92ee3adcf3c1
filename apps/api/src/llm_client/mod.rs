//! Anthropic Messages API client used by the `anthropic` enhancement provider.
//!
//! Every call is a single attempt bounded by the client timeout. Whether to
//! try again is the retry controller's decision, never this module's.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;
pub mod provider;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLM returned empty content")]
    EmptyContent,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<Block>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl LlmClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            endpoint: ANTHROPIC_API_URL.to_string(),
        })
    }

    /// Points the client at a different Messages endpoint (a proxy or a test server).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// One completion; returns the first text block.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let body = MessagesRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            system,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            warn!("Anthropic API returned {status}");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let reply: MessagesResponse = response.json().await?;
        if let Some(usage) = &reply.usage {
            debug!(
                "LLM call used {} input / {} output tokens",
                usage.input_tokens, usage.output_tokens
            );
        }

        reply
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyContent)
    }

    /// `complete`, parsing the reply as JSON. The prompt must ask for JSON only;
    /// a surrounding markdown fence is tolerated.
    pub async fn complete_json(&self, system: &str, prompt: &str) -> Result<Value, LlmError> {
        let text = self.complete(system, prompt).await?;
        Ok(serde_json::from_str(unfence(&text))?)
    }
}

/// Removes a markdown code fence (with or without a language tag) around a reply.
fn unfence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches("json"),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}
