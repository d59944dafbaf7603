//! LLM provider client.
//!
//! One HTTP client speaks an Anthropic-style messages API; the trait keeps
//! the loop testable and providers swappable. Usage normalization happens
//! at this boundary: whatever the provider reports becomes a [`TurnUsage`].

use async_trait::async_trait;
use kiwi_types::TurnUsage;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model response is malformed: {0}")]
    Malformed(String),
}

/// A tool definition as exposed to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One transcript entry. `content` is the provider-shaped block array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Value,
}

impl ChatMessage {
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: json!([{ "type": "text", "text": text }]),
        }
    }
}

/// A content block in a model response.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Unknown block type - forward compatibility
    #[serde(other)]
    Unknown,
}

/// One model turn.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Option<TurnUsage>,
    pub stop_reason: Option<String>,
}

impl ModelResponse {
    /// Concatenated text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<&str>>()
            .join("\n")
    }

    #[must_use]
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// The seam the agent loop talks through.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError>;
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Anthropic-style messages API over HTTP.
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MAX_TOKENS: u32 = 4096;

    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(
        &self,
        model: &str,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Value {
        let mut body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(
        &self,
        model: &str,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        let body = self.build_body(model, system, messages, tools);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        let usage = api.usage.map(|u| {
            TurnUsage::from_provider(u.input_tokens, u.output_tokens, u.total_tokens)
        });
        Ok(ModelResponse {
            content: api.content,
            usage,
            stop_reason: api.stop_reason,
        })
    }
}
