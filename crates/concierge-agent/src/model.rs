//! Model API boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use concierge_types::{ContentBlock, ConversationTurn, TokenUsage, ToolSpec};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Failed to decode model response: {0}")]
    Decode(String),
    #[error("Missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),
}

impl ModelError {
    /// Rate limited (429) or overloaded (529).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Api { status: 429 | 529, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub turns: Vec<ConversationTurn>,
    pub tools: Vec<ToolSpec>,
    /// When false the model is told not to call tools; `tools` are still
    /// sent so earlier tool blocks in `turns` stay valid.
    pub allow_tools: bool,
    pub max_tokens: u32,
    /// Mark the system prompt and tool list as cacheable prefixes.
    pub cache_hints: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}
