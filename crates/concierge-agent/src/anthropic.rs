//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use concierge_config::ModelConfig;
use concierge_types::{ContentBlock, TokenUsage};

use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse, StopReason};

pub const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    /// Multiplied by 15 (rate limit) or 10 (overload) and doubled per attempt.
    backoff_unit: Duration,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Read the API key from the variable named in `config`.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelError::MissingCredentials(config.api_key_env.clone()))?;
        Ok(Self::new(api_key, config.base_url.clone()).with_max_retries(config.max_retries))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    async fn send_once(&self, body: &Value) -> Result<ModelResponse, (ModelError, Option<String>)> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| (ModelError::Http(e), None))?;

        let status = response.status();
        if status.is_success() {
            let value: Value = response.json().await.map_err(|e| (ModelError::Http(e), None))?;
            return parse_response(value).map_err(|e| (e, None));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err((
            ModelError::Api {
                status: status.as_u16(),
                body,
            },
            retry_after,
        ))
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = request_body(&request);
        let mut attempt = 0;
        loop {
            debug!(
                model = %request.model,
                turns = request.turns.len(),
                tools = request.tools.len(),
                attempt,
                "-> messages"
            );
            match self.send_once(&body).await {
                Ok(response) => {
                    debug!(
                        stop_reason = ?response.stop_reason,
                        input = response.usage.input_tokens,
                        output = response.usage.output_tokens,
                        cache_read = response.usage.cache_read_input_tokens,
                        "<- messages"
                    );
                    return Ok(response);
                }
                Err((err, retry_after)) if err.is_retryable() && attempt < self.max_retries => {
                    let status = match &err {
                        ModelError::Api { status, .. } => *status,
                        _ => 0,
                    };
                    let wait = retry_delay(status, retry_after.as_deref(), attempt, self.backoff_unit);
                    warn!(
                        status,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "Model API busy, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }
}

/// Delay before retry `attempt` (0-based). `retry-after` wins for 429.
fn retry_delay(status: u16, retry_after: Option<&str>, attempt: u32, unit: Duration) -> Duration {
    if status == 429 {
        if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
            return Duration::from_secs(secs);
        }
    }
    let base = if status == 429 { 15 } else { 10 };
    unit * base * 2u32.saturating_pow(attempt)
}

fn request_body(request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request
        .turns
        .iter()
        .map(|turn| json!({"role": turn.role.as_str(), "content": turn.content}))
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });

    if !request.system.is_empty() {
        body["system"] = if request.cache_hints {
            json!([{
                "type": "text",
                "text": request.system,
                "cache_control": {"type": "ephemeral"},
            }])
        } else {
            Value::String(request.system.clone())
        };
    }

    if !request.tools.is_empty() {
        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        if request.cache_hints {
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = json!({"type": "ephemeral"});
            }
        }
        body["tools"] = Value::Array(tools);
        if !request.allow_tools {
            body["tool_choice"] = json!({"type": "none"});
        }
    }

    body
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<StopReason>,
    usage: ApiUsage,
}

fn parse_response(value: Value) -> Result<ModelResponse, ModelError> {
    let parsed: ApiResponse =
        serde_json::from_value(value).map_err(|e| ModelError::Decode(e.to_string()))?;
    let content = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            ResponseBlock::Other => None,
        })
        .collect();
    Ok(ModelResponse {
        content,
        stop_reason: parsed.stop_reason.unwrap_or(StopReason::Other),
        usage: TokenUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_input_tokens: parsed.usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: parsed.usage.cache_creation_input_tokens.unwrap_or(0),
        },
    })
}
