//! The bounded tool-use loop.
//!
//! Each iteration sends the turns and the catalog to the model. Tool calls in
//! a response run concurrently and their results come back as one user turn,
//! in the order the calls were requested. After `max_iterations` model calls,
//! or once spend reaches `token_budget`, one last call is made with tools
//! disabled and the run ends as aborted-but-answered.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use concierge_config::{ConciergeConfig, ConsumerConfig};
use concierge_hooks::{HookEvent, HookRegistry};
use concierge_mcp::{CatalogView, McpError, ToolRegistry};
use concierge_storage::{
    ApprovalStatus, ConversationStore, PendingApproval, ToolCallRecord,
};
use concierge_tools::policy::requires_approval;
use concierge_tools::schema::minimize;
use concierge_types::{ContentBlock, ConversationTurn, PhasePolicy, Role, TokenUsage, ToolSpec};

use crate::approval::{ApprovalBroker, ApprovalDecision};
use crate::error::AgentError;
use crate::model::{ModelClient, ModelRequest, ModelResponse};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant.";
const REJECTED_TEXT: &str = "Rejected by operator. The action was not performed.";
const EXPIRED_TEXT: &str = "The approval request expired. The action was not performed.";
const CANCELLED_TEXT: &str = "The run was cancelled before the operator answered.";

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system: String,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub token_budget: u64,
    pub tool_result_max_chars: usize,
    pub cache_hints: bool,
}

impl LoopConfig {
    pub fn for_consumer(config: &ConciergeConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            model: consumer
                .model
                .clone()
                .unwrap_or_else(|| config.model.model.clone()),
            system: consumer
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: config.model.max_tokens,
            max_iterations: config.agent.max_iterations,
            token_budget: config.agent.token_budget,
            tool_result_max_chars: config.agent.tool_result_max_chars,
            cache_hints: true,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::for_consumer(&ConciergeConfig::default(), &ConsumerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The model answered without requesting tools.
    Done,
    /// Closed out after `max_iterations` model calls.
    IterationLimit,
    /// Closed out after spend reached `token_budget`.
    TokenBudget,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Done => "done",
            Termination::IterationLimit => "aborted_iteration_limit",
            Termination::TokenBudget => "aborted_token_budget",
        }
    }

    pub fn is_aborted(&self) -> bool {
        !matches!(self, Termination::Done)
    }

    fn fallback_answer(&self) -> &'static str {
        match self {
            Termination::TokenBudget => {
                "I ran out of budget for this request. Here is what I found so far."
            }
            _ => "I reached the step limit for this request before finishing.",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Model calls made with tools enabled.
    pub iterations: u32,
    pub usage: TokenUsage,
    /// Tool calls that reached a server.
    pub tool_calls: u32,
    pub termination: Option<Termination>,
}

impl LoopState {
    /// Tokens counted against the budget.
    pub fn spend(&self) -> u64 {
        self.usage.input_tokens + self.usage.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    /// Every turn of the run, starting with the ones passed in.
    pub turns: Vec<ConversationTurn>,
    pub state: LoopState,
}

impl LoopOutcome {
    pub fn termination(&self) -> Termination {
        self.state.termination.unwrap_or(Termination::Done)
    }
}

struct CallResult {
    block: ContentBlock,
    dispatched: bool,
}

pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalBroker>,
    store: Option<Arc<dyn ConversationStore>>,
    hooks: Option<Arc<HookRegistry>>,
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalBroker>,
        config: LoopConfig,
    ) -> Self {
        Self {
            model,
            registry,
            approvals,
            store: None,
            hooks: None,
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub async fn run(
        &self,
        view: &CatalogView,
        policy: &PhasePolicy,
        turns: Vec<ConversationTurn>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, AgentError> {
        self.drive(view, policy, turns, LoopState::default(), cancel).await
    }

    /// Continue a run whose last turn is an assistant turn with tool calls,
    /// one of which already has an operator decision.
    pub async fn resume(
        &self,
        view: &CatalogView,
        policy: &PhasePolicy,
        snapshot: Vec<ConversationTurn>,
        tool_use_id: &str,
        decision: ApprovalDecision,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, AgentError> {
        let mut turns = snapshot;
        let mut state = LoopState::default();
        let pending = turns
            .last()
            .filter(|t| t.role == Role::Assistant && t.has_tool_uses())
            .cloned();
        if let Some(assistant) = pending {
            let results = self
                .execute_tools(
                    view,
                    policy,
                    &turns,
                    &assistant,
                    Some((tool_use_id, decision)),
                    &mut state,
                    cancel,
                )
                .await?;
            turns.push(results);
        }
        self.drive(view, policy, turns, state, cancel).await
    }

    async fn drive(
        &self,
        view: &CatalogView,
        policy: &PhasePolicy,
        mut turns: Vec<ConversationTurn>,
        mut state: LoopState,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, AgentError> {
        let tools: Vec<ToolSpec> = view.tools().map(|t| minimize(&t.to_spec())).collect();
        let consumer = view.consumer();

        loop {
            if cancel.is_cancelled() {
                info!(consumer, iterations = state.iterations, "Run cancelled");
                return Err(AgentError::Cancelled);
            }

            let limit = if state.iterations >= self.config.max_iterations {
                Some(Termination::IterationLimit)
            } else if state.spend() >= self.config.token_budget {
                Some(Termination::TokenBudget)
            } else {
                None
            };

            if let Some(reason) = limit {
                warn!(
                    consumer,
                    reason = reason.as_str(),
                    iterations = state.iterations,
                    spend = state.spend(),
                    "Run limit reached, asking for a closing answer"
                );
                let response = self.call_model(&turns, &tools, false, cancel).await?;
                state.usage.add(&response.usage);
                let text = response.text();
                let answer = if text.trim().is_empty() {
                    reason.fallback_answer().to_string()
                } else {
                    text
                };
                turns.push(ConversationTurn {
                    role: Role::Assistant,
                    content: vec![ContentBlock::text(answer.clone())],
                    usage: response.usage,
                });
                state.termination = Some(reason);
                return Ok(LoopOutcome {
                    answer,
                    turns,
                    state,
                });
            }

            let response = self.call_model(&turns, &tools, true, cancel).await?;
            state.iterations += 1;
            state.usage.add(&response.usage);
            debug!(
                consumer,
                iteration = state.iterations,
                stop_reason = ?response.stop_reason,
                spend = state.spend(),
                "Model responded"
            );

            let assistant = ConversationTurn {
                role: Role::Assistant,
                content: response.content,
                usage: response.usage,
            };
            if !assistant.has_tool_uses() {
                let answer = assistant.text();
                turns.push(assistant);
                state.termination = Some(Termination::Done);
                return Ok(LoopOutcome {
                    answer,
                    turns,
                    state,
                });
            }

            turns.push(assistant.clone());
            let results = self
                .execute_tools(view, policy, &turns, &assistant, None, &mut state, cancel)
                .await?;
            turns.push(results);
        }
    }

    async fn call_model(
        &self,
        turns: &[ConversationTurn],
        tools: &[ToolSpec],
        allow_tools: bool,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AgentError> {
        let request = ModelRequest {
            model: self.config.model.clone(),
            system: self.config.system.clone(),
            turns: turns.to_vec(),
            tools: tools.to_vec(),
            allow_tools,
            max_tokens: self.config.max_tokens,
            cache_hints: self.config.cache_hints,
        };
        tokio::select! {
            response = self.model.complete(request) => Ok(response?),
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_tools(
        &self,
        view: &CatalogView,
        policy: &PhasePolicy,
        snapshot: &[ConversationTurn],
        assistant: &ConversationTurn,
        decided: Option<(&str, ApprovalDecision)>,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, AgentError> {
        let calls = assistant.tool_uses().map(|(id, name, input)| {
            let predecided = decided.and_then(|(decided_id, d)| (decided_id == id).then_some(d));
            self.execute_call(view, policy, snapshot, id, name, input.clone(), predecided, cancel)
        });

        let results = tokio::select! {
            results = join_all(calls) => results,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        state.tool_calls += results.iter().filter(|r| r.dispatched).count() as u32;
        Ok(ConversationTurn::new(
            Role::User,
            results.into_iter().map(|r| r.block).collect(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_call(
        &self,
        view: &CatalogView,
        policy: &PhasePolicy,
        snapshot: &[ConversationTurn],
        id: &str,
        name: &str,
        input: Value,
        predecided: Option<ApprovalDecision>,
        cancel: &CancellationToken,
    ) -> CallResult {
        if requires_approval(policy, name) {
            let decision = match predecided {
                Some(decision) => decision,
                None => {
                    match self
                        .await_approval(view.consumer(), snapshot, id, name, &input, cancel)
                        .await
                    {
                        Some(decision) => decision,
                        None => {
                            return CallResult {
                                block: ContentBlock::tool_error(id, CANCELLED_TEXT),
                                dispatched: false,
                            };
                        }
                    }
                }
            };
            if !decision.is_approved() {
                info!(consumer = view.consumer(), tool = name, ?decision, "Tool call not approved");
                self.emit(HookEvent::ToolCallAfter {
                    consumer: view.consumer().to_string(),
                    tool_name: name.to_string(),
                    is_error: true,
                    latency_ms: 0,
                })
                .await;
                let text = match decision {
                    ApprovalDecision::Expired => EXPIRED_TEXT,
                    _ => REJECTED_TEXT,
                };
                return CallResult {
                    block: ContentBlock::tool_error(id, text),
                    dispatched: false,
                };
            }
        }
        self.dispatch(view, id, name, input).await
    }

    async fn await_approval(
        &self,
        consumer: &str,
        snapshot: &[ConversationTurn],
        tool_use_id: &str,
        tool_name: &str,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let ticket = self.approvals.register().await;
        let request_id = ticket.request_id.clone();

        if let Some(store) = &self.store {
            let pending = PendingApproval {
                request_id: request_id.clone(),
                consumer: consumer.to_string(),
                tool_use_id: tool_use_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
                snapshot: snapshot.to_vec(),
                status: ApprovalStatus::Pending,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = store.save_pending_approval(&pending).await {
                warn!(consumer, request_id = %request_id, error = %e, "Failed to persist pending approval");
            }
        }

        info!(consumer, tool = tool_name, request_id = %request_id, "Waiting for operator approval");
        self.emit(HookEvent::ApprovalRequested {
            request_id: request_id.clone(),
            consumer: consumer.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        })
        .await;

        let decision = self.approvals.wait(ticket, cancel).await;

        if let (Some(store), Some(decision)) = (&self.store, decision) {
            let status = match decision {
                ApprovalDecision::Approved => ApprovalStatus::Approved,
                ApprovalDecision::Rejected => ApprovalStatus::Rejected,
                ApprovalDecision::Expired => ApprovalStatus::Expired,
            };
            if let Err(e) = store.resolve_pending_approval(&request_id, status).await {
                warn!(request_id = %request_id, error = %e, "Failed to record approval decision");
            }
        }
        decision
    }

    async fn dispatch(&self, view: &CatalogView, id: &str, name: &str, input: Value) -> CallResult {
        let consumer = view.consumer();
        self.emit(HookEvent::ToolCallBefore {
            consumer: consumer.to_string(),
            tool_name: name.to_string(),
            arguments: input.clone(),
        })
        .await;

        let started = Instant::now();
        let outcome = self.registry.dispatch(view, name, input.clone()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (text, is_error) = match outcome {
            Ok(text) => (text, false),
            Err(e) => {
                warn!(consumer, tool = name, error = %e, "Tool call failed");
                (tool_error_text(&e), true)
            }
        };
        info!(consumer, tool = name, latency_ms, is_error, "Tool call finished");

        if let Some(store) = &self.store {
            let record = ToolCallRecord {
                consumer: consumer.to_string(),
                tool_name: name.to_string(),
                arguments: input,
                result: text.clone(),
                is_error,
                latency_ms,
                model: self.config.model.clone(),
            };
            if let Err(e) = store.log_tool_call(&record).await {
                warn!(consumer, tool = name, error = %e, "Failed to log tool call");
            }
        }

        self.emit(HookEvent::ToolCallAfter {
            consumer: consumer.to_string(),
            tool_name: name.to_string(),
            is_error,
            latency_ms,
        })
        .await;

        let content = truncate_result(&text, self.config.tool_result_max_chars);
        CallResult {
            block: if is_error {
                ContentBlock::tool_error(id, content)
            } else {
                ContentBlock::tool_result(id, content)
            },
            dispatched: true,
        }
    }

    async fn emit(&self, event: HookEvent) {
        if let Some(hooks) = &self.hooks {
            hooks.emit(event).await;
        }
    }
}

fn tool_error_text(error: &McpError) -> String {
    match error {
        McpError::UnknownTool(name) => {
            format!("Error: there is no tool named {name}. Use one of the listed tools.")
        }
        other => format!("Error: {other}"),
    }
}

/// Cut `text` to `max_chars` characters, marking the cut.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}\n...[truncated]")
}
