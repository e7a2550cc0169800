//! One request end to end: resolve the consumer, lease its catalog, assemble
//! context, run the loop, persist, release.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use concierge_config::ConciergeConfig;
use concierge_hooks::{HookEvent, HookRegistry};
use concierge_mcp::{
    CatalogView, InstanceManager, InstanceStatus, McpError, StdioLauncher, ToolRegistry, factory,
};
use concierge_storage::{ApprovalStatus, ConversationStore, SqliteStore};
use concierge_tools::policy::{active_policy, is_allowed};
use concierge_types::{ConversationTurn, InstanceKey, LaunchSpec, PhasePolicy, Role, TokenUsage};

use crate::anthropic::AnthropicClient;
use crate::approval::{ApprovalBroker, ApprovalDecision};
use crate::context::ContextAssembler;
use crate::error::AgentError;
use crate::model::ModelClient;
use crate::runner::{AgentLoop, LoopConfig, LoopOutcome, Termination};
use crate::summarizer::Summarizer;

/// The answer to one request.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub termination: Termination,
    pub iterations: u32,
    pub tool_calls: u32,
    pub usage: TokenUsage,
}

impl From<LoopOutcome> for AgentReply {
    fn from(outcome: LoopOutcome) -> Self {
        Self {
            termination: outcome.termination(),
            text: outcome.answer,
            iterations: outcome.state.iterations,
            tool_calls: outcome.state.tool_calls,
            usage: outcome.state.usage,
        }
    }
}

pub struct AgentRuntime {
    config: ConciergeConfig,
    /// Relative paths in instance configs resolve against this.
    base_dir: PathBuf,
    registry: Arc<ToolRegistry>,
    model: Arc<dyn ModelClient>,
    store: Arc<dyn ConversationStore>,
    hooks: Arc<HookRegistry>,
    approvals: Arc<ApprovalBroker>,
    context: ContextAssembler,
}

impl AgentRuntime {
    pub fn new(
        config: ConciergeConfig,
        base_dir: PathBuf,
        registry: Arc<ToolRegistry>,
        model: Arc<dyn ModelClient>,
        store: Arc<dyn ConversationStore>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let expiry = config.agent.approval_expiry_secs.map(Duration::from_secs);
        let summarizer = Summarizer::from_config(model.clone(), &config.context);
        let context = ContextAssembler::new(store.clone(), Some(summarizer), config.context.clone());
        Self {
            config,
            base_dir,
            registry,
            model,
            store,
            hooks,
            approvals: Arc::new(ApprovalBroker::new(expiry)),
            context,
        }
    }

    /// Wire the production stack: stdio servers, the hosted model, SQLite.
    pub fn from_config(config: ConciergeConfig, base_dir: PathBuf) -> Result<Self, AgentError> {
        let launcher = Arc::new(StdioLauncher::new((&config.servers).into()));
        let cooldown = Duration::from_millis(config.servers.release_cooldown_ms);
        let manager = Arc::new(InstanceManager::new(launcher, cooldown));
        let registry = Arc::new(ToolRegistry::new(manager));

        let model = Arc::new(AnthropicClient::from_config(&config.model)?);

        let db_path = config.database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::Config(e.into()))?;
        }
        let store = Arc::new(SqliteStore::open(&db_path)?);
        info!(db = %db_path.display(), "Opened conversation store");

        Ok(Self::new(
            config,
            base_dir,
            registry,
            model,
            store,
            Arc::new(HookRegistry::new()),
        ))
    }

    pub fn config(&self) -> &ConciergeConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn pending_approvals(&self) -> Vec<String> {
        self.approvals.pending_ids().await
    }

    /// Answer `message` on behalf of `consumer_id`.
    pub async fn ask(
        &self,
        consumer_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, AgentError> {
        let agent = self.agent_loop(consumer_id)?;
        let (view, policy) = self.open_catalog(consumer_id).await?;
        info!(consumer = consumer_id, tools = view.len(), "Starting run");

        let result = self
            .run_and_persist(&agent, &view, &policy, consumer_id, message, cancel)
            .await;

        self.registry.release(view).await;
        self.finish(consumer_id, result).await
    }

    /// Deliver an operator decision.
    ///
    /// Returns `None` when a live run was waiting and picked the decision up.
    /// Otherwise the run is resumed from its persisted snapshot and its reply
    /// is returned.
    pub async fn resolve_approval(
        &self,
        request_id: &str,
        approved: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<AgentReply>, AgentError> {
        if self.approvals.resolve(request_id, approved).await {
            info!(request_id, approved, "Approval delivered to waiting run");
            self.emit_resolved(request_id, approved).await;
            return Ok(None);
        }

        let pending = self
            .store
            .load_pending_approval(request_id)
            .await?
            .ok_or_else(|| AgentError::ApprovalNotFound(request_id.to_string()))?;
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        if !self.store.resolve_pending_approval(request_id, status).await? {
            return Err(AgentError::ApprovalNotFound(request_id.to_string()));
        }
        self.emit_resolved(request_id, approved).await;

        let consumer_id = pending.consumer.as_str();
        info!(
            consumer = consumer_id,
            request_id,
            tool = %pending.tool_name,
            approved,
            "Resuming run from persisted approval"
        );
        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected
        };
        let question = last_user_message(&pending.snapshot);

        let agent = self.agent_loop(consumer_id)?;
        let (view, policy) = self.open_catalog(consumer_id).await?;
        let result = match agent
            .resume(
                &view,
                &policy,
                pending.snapshot.clone(),
                &pending.tool_use_id,
                decision,
                cancel,
            )
            .await
        {
            Ok(outcome) => match &question {
                Some(question) => self
                    .persist(consumer_id, question, &outcome.answer)
                    .await
                    .map(|()| outcome),
                None => Ok(outcome),
            },
            Err(e) => Err(e),
        };

        self.registry.release(view).await;
        self.finish(consumer_id, result).await.map(Some)
    }

    /// Forget a consumer's history and summary.
    pub async fn reset(&self, consumer_id: &str) -> Result<(), AgentError> {
        self.config.consumer(consumer_id)?;
        self.store.clear_history(consumer_id).await?;
        Ok(())
    }

    pub async fn instances(&self) -> Vec<InstanceStatus> {
        self.registry.manager().list_instances().await
    }

    pub async fn shutdown(&self) {
        self.registry.manager().shutdown().await;
    }

    fn agent_loop(&self, consumer_id: &str) -> Result<AgentLoop, AgentError> {
        let consumer = self.config.consumer(consumer_id)?;
        Ok(AgentLoop::new(
            self.model.clone(),
            self.registry.clone(),
            self.approvals.clone(),
            LoopConfig::for_consumer(&self.config, consumer),
        )
        .with_store(self.store.clone())
        .with_hooks(self.hooks.clone()))
    }

    /// Lease the consumer's instances and hide tools its phase does not allow.
    async fn open_catalog(&self, consumer_id: &str) -> Result<(CatalogView, PhasePolicy), AgentError> {
        let consumer = self.config.consumer(consumer_id)?;
        let instances = self
            .config
            .consumer_instances(consumer_id)?
            .into_iter()
            .map(|resolved| -> Result<(InstanceKey, LaunchSpec), McpError> {
                let spec = factory::launch_spec(resolved.id, resolved.config, &self.base_dir)?;
                Ok((resolved.key, spec))
            })
            .collect::<Result<Vec<_>, McpError>>()?;
        let capabilities = self.config.consumer_capabilities(consumer_id)?;
        let policy = active_policy(consumer, &capabilities);

        let mut view = self.registry.build_catalog(consumer_id, &instances).await?;
        let offered = view.len();
        view.retain(|tool| is_allowed(&policy, &tool.public_name));
        debug!(
            consumer = consumer_id,
            phase = consumer.phase.as_str(),
            offered,
            allowed = view.len(),
            "Applied tool policy"
        );
        Ok((view, policy))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_and_persist(
        &self,
        agent: &AgentLoop,
        view: &CatalogView,
        policy: &PhasePolicy,
        consumer_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, AgentError> {
        let turns = self.context.assemble(consumer_id, message).await?;
        let outcome = agent.run(view, policy, turns, cancel).await?;
        self.persist(consumer_id, message, &outcome.answer).await?;
        Ok(outcome)
    }

    async fn persist(&self, consumer_id: &str, question: &str, answer: &str) -> Result<(), AgentError> {
        self.store
            .append_turns(
                consumer_id,
                &[ConversationTurn::user(question), ConversationTurn::assistant(answer)],
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        consumer_id: &str,
        result: Result<LoopOutcome, AgentError>,
    ) -> Result<AgentReply, AgentError> {
        let (reason, iterations, tokens) = match &result {
            Ok(outcome) => (
                outcome.termination().as_str(),
                outcome.state.iterations,
                outcome.state.spend(),
            ),
            Err(AgentError::Cancelled) => ("cancelled", 0, 0),
            Err(_) => ("error", 0, 0),
        };
        info!(consumer = consumer_id, reason, iterations, tokens, "Run finished");
        self.hooks
            .emit(HookEvent::RunFinished {
                consumer: consumer_id.to_string(),
                reason: reason.to_string(),
                iterations,
                tokens,
            })
            .await;
        result.map(AgentReply::from)
    }

    async fn emit_resolved(&self, request_id: &str, approved: bool) {
        self.hooks
            .emit(HookEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                approved,
            })
            .await;
    }
}

/// The most recent user turn that carries text rather than tool results.
fn last_user_message(turns: &[ConversationTurn]) -> Option<String> {
    turns
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .map(ConversationTurn::text)
        .find(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use concierge_config::{ConsumerConfig, InstanceConfig};
    use concierge_mcp::testing::{FakeLauncher, FakeServer};
    use concierge_storage::{MemoryStore, PendingApproval};
    use concierge_types::{CapabilityType, ContentBlock, Phase};
    use serde_json::json;

    use crate::testing::ScriptedModel;

    fn config(phase: Phase) -> ConciergeConfig {
        let mut instances = BTreeMap::new();
        instances.insert("gmail-work".to_string(), InstanceConfig::new(CapabilityType::Gmail));
        let mut consumers = BTreeMap::new();
        consumers.insert(
            "inbox".to_string(),
            ConsumerConfig {
                phase,
                services: vec!["gmail-work".into()],
                ..Default::default()
            },
        );
        ConciergeConfig {
            instances,
            consumers,
            default_consumer: "inbox".into(),
            ..Default::default()
        }
    }

    struct Setup {
        runtime: Arc<AgentRuntime>,
        launcher: Arc<FakeLauncher>,
        store: Arc<MemoryStore>,
        model: Arc<ScriptedModel>,
    }

    fn setup(phase: Phase, model: ScriptedModel) -> Setup {
        setup_with_store(phase, model, Arc::new(MemoryStore::new()))
    }

    fn setup_with_store(phase: Phase, model: ScriptedModel, store: Arc<MemoryStore>) -> Setup {
        let launcher = Arc::new(FakeLauncher::new(FakeServer::with_tools(&[
            "search_emails",
            "send_email",
        ])));
        let manager = Arc::new(InstanceManager::new(launcher.clone(), Duration::ZERO));
        let registry = Arc::new(ToolRegistry::new(manager));
        let model = Arc::new(model);
        let runtime = Arc::new(AgentRuntime::new(
            config(phase),
            PathBuf::from("."),
            registry,
            model.clone(),
            store.clone(),
            Arc::new(HookRegistry::new()),
        ));
        Setup {
            runtime,
            launcher,
            store,
            model,
        }
    }

    fn gmail_key() -> InstanceKey {
        InstanceKey::new(CapabilityType::Gmail, "gmail-work")
    }

    #[tokio::test]
    async fn test_ask_filters_catalog_and_persists() {
        let s = setup(Phase::ReadOnly, ScriptedModel::new().then_text("Nothing new."));
        let reply = s
            .runtime
            .ask("inbox", "any mail?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "Nothing new.");
        assert_eq!(reply.termination, Termination::Done);
        let tools: Vec<String> = s.model.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(tools, vec!["search_emails".to_string()]);

        let history = s.store.load_history("inbox", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "any mail?");
        assert_eq!(history[1].text(), "Nothing new.");
        assert_eq!(s.runtime.registry().manager().refcount(&gmail_key()).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_consumer() {
        let s = setup(Phase::ReadOnly, ScriptedModel::new());
        let err = s
            .runtime
            .ask("nobody", "hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownConsumer(id) if id == "nobody"));
        assert_eq!(s.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_failed_run_still_releases_catalog() {
        let s = setup(Phase::ReadOnly, ScriptedModel::new().then_error(400));
        let err = s
            .runtime
            .ask("inbox", "hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(s.runtime.registry().manager().refcount(&gmail_key()).await, 0);
        assert!(s.store.load_history("inbox", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_approval() {
        let s = setup(
            Phase::Controlled,
            ScriptedModel::new()
                .then_tool_call("send_email", json!({"to": "a@b.c"}))
                .then_text("Sent."),
        );
        let runtime = s.runtime.clone();
        let run = tokio::spawn(async move {
            runtime.ask("inbox", "send it", &CancellationToken::new()).await
        });

        let mut request_id = None;
        for _ in 0..200 {
            if let Some(id) = s.runtime.pending_approvals().await.into_iter().next() {
                request_id = Some(id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request_id = request_id.expect("approval requested");
        assert!(s.launcher.all_calls().is_empty());

        let resumed = s
            .runtime
            .resolve_approval(&request_id, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(resumed.is_none());

        let reply = run.await.unwrap().unwrap();
        assert_eq!(reply.text, "Sent.");
        assert_eq!(reply.tool_calls, 1);
        assert_eq!(s.launcher.all_calls()[0].0, "send_email");
    }

    #[tokio::test]
    async fn test_resume_from_persisted_approval() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_pending_approval(&PendingApproval {
                request_id: "req-1".into(),
                consumer: "inbox".into(),
                tool_use_id: "toolu_7".into(),
                tool_name: "send_email".into(),
                arguments: json!({"to": "a@b.c"}),
                snapshot: vec![
                    ConversationTurn::user("email Bob"),
                    ConversationTurn::new(
                        Role::Assistant,
                        vec![ContentBlock::ToolUse {
                            id: "toolu_7".into(),
                            name: "send_email".into(),
                            input: json!({"to": "a@b.c"}),
                        }],
                    ),
                ],
                status: ApprovalStatus::Pending,
                created_at: 0,
            })
            .await
            .unwrap();
        let s = setup_with_store(
            Phase::Controlled,
            ScriptedModel::new().then_text("Done, Bob has it."),
            store,
        );

        let reply = s
            .runtime
            .resolve_approval("req-1", true, &CancellationToken::new())
            .await
            .unwrap()
            .expect("resumed run");

        assert_eq!(reply.text, "Done, Bob has it.");
        assert_eq!(
            s.launcher.all_calls(),
            vec![("send_email".to_string(), json!({"to": "a@b.c"}))]
        );
        let request = &s.model.requests()[0];
        assert_eq!(request.turns.len(), 3);
        assert!(s.store.load_pending_approval("req-1").await.unwrap().is_none());

        let history = s.store.load_history("inbox", 10).await.unwrap();
        assert_eq!(history[0].text(), "email Bob");
        assert_eq!(s.runtime.registry().manager().refcount(&gmail_key()).await, 0);

        let again = s
            .runtime
            .resolve_approval("req-1", true, &CancellationToken::new())
            .await;
        assert!(matches!(again, Err(AgentError::ApprovalNotFound(_))));
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let s = setup(Phase::ReadOnly, ScriptedModel::new().then_text("hi"));
        s.runtime.ask("inbox", "hello", &CancellationToken::new()).await.unwrap();
        s.runtime.reset("inbox").await.unwrap();
        assert!(s.store.load_history("inbox", 10).await.unwrap().is_empty());
    }
}
