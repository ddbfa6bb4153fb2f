//! Completer client - HTTP client for OpenAI-compatible APIs
//!
//! Uses reqwest to call chat-completion endpoints. Compatible with:
//! - OpenAI
//! - Azure OpenAI
//! - DeepSeek
//! - Other OpenAI-compatible APIs

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CompleterConfig;

use super::error::CompleterError;

const SYSTEM_PROMPT: &str = "You are an expert SQL optimizer. Follow the \
requested output format exactly; when JSON is requested, return only valid JSON.";

/// The LLM oracle behind every rewrite, ranking, and snipe call.
///
/// Implementations must respect the deadline; callers absorb every error as
/// a failed attempt.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, CompleterError>;
}

/// Completer over an OpenAI-compatible chat-completions endpoint
pub struct HttpCompleter {
    http_client: Client,
    config: CompleterConfig,
}

impl HttpCompleter {
    pub fn new(config: CompleterConfig) -> Result<Self, CompleterError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CompleterError::Api(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { http_client, config })
    }
}

#[async_trait]
impl Completer for HttpCompleter {
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, CompleterError> {
        if self.config.api_key.is_empty() {
            return Err(CompleterError::MissingApiKey);
        }

        let chat_request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: SYSTEM_PROMPT.to_string() },
                ChatMessage { role: "user".to_string(), content: prompt.to_string() },
            ],
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));

        tracing::debug!("Calling completer: {} with model {}", url, self.config.model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .timeout(deadline)
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompleterError::Timeout(deadline.as_secs())
                } else {
                    CompleterError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(CompleterError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompleterError::Api(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CompleterError::Parse(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| CompleterError::Parse("empty response from completer".to_string()))?;

        if content.trim().is_empty() {
            return Err(CompleterError::Parse("empty response from completer".to_string()));
        }

        if let Some(usage) = &chat_response.usage {
            tracing::debug!(
                "Completer usage: {} prompt + {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        Ok(content.clone())
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}
