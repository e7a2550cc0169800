//! A scripted [`ModelClient`] for exercising the loop without network access.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use concierge_types::{ContentBlock, TokenUsage};

use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse, StopReason};

#[derive(Clone)]
enum Step {
    Text(String),
    ToolCalls(Vec<(String, Value)>),
    Fail(u16),
}

/// Replays queued responses in order; once the queue is empty, repeats the
/// `always_*` step if one is set, otherwise answers `"done"`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    usage: TokenUsage,
    requests: Mutex<Vec<ModelRequest>>,
    next_id: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            requests: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    fn push(self, step: Step) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.push(Step::Text(text.to_string()))
    }

    pub fn then_tool_call(self, name: &str, input: Value) -> Self {
        self.push(Step::ToolCalls(vec![(name.to_string(), input)]))
    }

    pub fn then_tool_calls(self, calls: &[(&str, Value)]) -> Self {
        let calls = calls.iter().map(|(n, v)| (n.to_string(), v.clone())).collect();
        self.push(Step::ToolCalls(calls))
    }

    pub fn then_error(self, status: u16) -> Self {
        self.push(Step::Fail(status))
    }

    /// Request this tool call on every call after the queue runs out,
    /// including calls made with tools disabled.
    pub fn always_tool_call(mut self, name: &str, input: Value) -> Self {
        self.repeat = Some(Step::ToolCalls(vec![(name.to_string(), input)]));
        self
    }

    /// Usage reported on every response.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
            ..Default::default()
        };
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let step = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Step::Text("done".into()));

        match step {
            Step::Text(text) => Ok(ModelResponse {
                content: vec![ContentBlock::Text { text }],
                stop_reason: StopReason::EndTurn,
                usage: self.usage,
            }),
            Step::ToolCalls(calls) => Ok(ModelResponse {
                content: calls
                    .into_iter()
                    .map(|(name, input)| ContentBlock::ToolUse {
                        id: format!("toolu_{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                        name,
                        input,
                    })
                    .collect(),
                stop_reason: StopReason::ToolUse,
                usage: self.usage,
            }),
            Step::Fail(status) => Err(ModelError::Api {
                status,
                body: "scripted failure".into(),
            }),
        }
    }
}
