use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use concierge_types::{CapabilityType, Framing, InstanceKey, Phase, ToolPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),
    #[error("Consumer {consumer} references unknown instance {instance}")]
    UnknownInstance { consumer: String, instance: String },
}

// ──────────────────── Model ────────────────────

/// Hosted model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Output token cap per model call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Extra attempts after a rate-limit or overload response.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
        }
    }
}

// ──────────────────── Agent Loop ────────────────────

/// Bounds for one tool-use run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Cumulative token spend after which the run is closed out.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    #[serde(default = "default_tool_result_max_chars")]
    pub tool_result_max_chars: usize,
    /// Pending approvals older than this are treated as rejected. No expiry when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_expiry_secs: Option<u64>,
}

fn default_max_iterations() -> u32 {
    15
}

fn default_token_budget() -> u64 {
    50_000
}

fn default_tool_result_max_chars() -> usize {
    2000
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            token_budget: default_token_budget(),
            tool_result_max_chars: default_tool_result_max_chars(),
            approval_expiry_secs: None,
        }
    }
}

// ──────────────────── Servers ────────────────────

/// Timeouts and lifecycle settings shared by all capability servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Delay between the last release and stopping the process.
    #[serde(default = "default_release_cooldown_ms")]
    pub release_cooldown_ms: u64,
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_release_cooldown_ms() -> u64 {
    2000
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            release_cooldown_ms: default_release_cooldown_ms(),
        }
    }
}

/// One named capability-server instance.
///
/// Credential fields hold *names* of environment variables, never secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    /// Account or workspace identity. Defaults to the instance id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<PathBuf>,
    /// Local checkout of a server that is not published to a registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_hash_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_string_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<Framing>,
    /// Replaces the built-in launch command for this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment passed verbatim to the process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn new(capability: CapabilityType) -> Self {
        Self {
            capability,
            account: None,
            credentials_dir: None,
            server_dir: None,
            site_name: None,
            user_email: None,
            api_token_env: None,
            api_id_env: None,
            api_hash_env: None,
            session_string_env: None,
            token_env: None,
            framing: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn key(&self, instance_id: &str) -> InstanceKey {
        InstanceKey::new(
            self.capability,
            self.account.clone().unwrap_or_else(|| instance_id.to_string()),
        )
    }
}

// ──────────────────── Consumers ────────────────────

/// A project or identity whose requests share instances and a tool policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phase: Phase,
    /// Instance ids from the top-level `instances` table.
    #[serde(default)]
    pub services: Vec<String>,
    /// Generated from the enabled capability types when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<ToolPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Overrides `model.model` for this consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A consumer service looked up in the `instances` table.
#[derive(Debug, Clone)]
pub struct ResolvedInstance<'a> {
    pub id: &'a str,
    pub key: InstanceKey,
    pub config: &'a InstanceConfig,
}

// ──────────────────── Context ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Persisted turns loaded per request.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_summarizer_model")]
    pub summarizer_model: String,
    #[serde(default = "default_summarizer_max_tokens")]
    pub summarizer_max_tokens: u32,
}

fn default_history_limit() -> usize {
    20
}

fn default_summarize_threshold() -> usize {
    20
}

fn default_keep_recent() -> usize {
    10
}

fn default_max_context_tokens() -> usize {
    150_000
}

fn default_summarizer_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_summarizer_max_tokens() -> u32 {
    500
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            summarize_threshold: default_summarize_threshold(),
            keep_recent: default_keep_recent(),
            max_context_tokens: default_max_context_tokens(),
            summarizer_model: default_summarizer_model(),
            summarizer_max_tokens: default_summarizer_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `~/.concierge/concierge.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ──────────────────── Root ────────────────────

/// Top-level concierge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentLimits,
    #[serde(default)]
    pub servers: ServersConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Named capability-server instances.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
    /// Named consumers.
    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerConfig>,
    #[serde(default = "default_consumer_name")]
    pub default_consumer: String,
}

fn default_consumer_name() -> String {
    "default".to_string()
}

impl Default for ConciergeConfig {
    fn default() -> Self {
        let mut consumers = BTreeMap::new();
        consumers.insert(
            "default".to_string(),
            ConsumerConfig {
                display_name: Some("Default".to_string()),
                system_prompt: Some("You are a helpful personal assistant.".to_string()),
                ..Default::default()
            },
        );

        Self {
            model: ModelConfig::default(),
            agent: AgentLimits::default(),
            servers: ServersConfig::default(),
            context: ContextConfig::default(),
            storage: StorageConfig::default(),
            instances: BTreeMap::new(),
            consumers,
            default_consumer: default_consumer_name(),
        }
    }
}

impl ConciergeConfig {
    pub fn consumer(&self, id: &str) -> Result<&ConsumerConfig, ConfigError> {
        self.consumers
            .get(id)
            .ok_or_else(|| ConfigError::UnknownConsumer(id.to_string()))
    }

    /// Resolve a consumer's services to instances, in declaration order.
    pub fn consumer_instances(
        &self,
        consumer_id: &str,
    ) -> Result<Vec<ResolvedInstance<'_>>, ConfigError> {
        let consumer = self.consumer(consumer_id)?;
        consumer
            .services
            .iter()
            .map(|instance_id| {
                let instance = self.instances.get(instance_id).ok_or_else(|| {
                    ConfigError::UnknownInstance {
                        consumer: consumer_id.to_string(),
                        instance: instance_id.clone(),
                    }
                })?;
                Ok(ResolvedInstance {
                    id: instance_id.as_str(),
                    key: instance.key(instance_id),
                    config: instance,
                })
            })
            .collect()
    }

    /// Distinct capability types a consumer has enabled.
    pub fn consumer_capabilities(&self, consumer_id: &str) -> Result<Vec<CapabilityType>, ConfigError> {
        let mut types = Vec::new();
        for resolved in self.consumer_instances(consumer_id)? {
            if !types.contains(&resolved.key.capability) {
                types.push(resolved.key.capability);
            }
        }
        Ok(types)
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("concierge.db")),
        }
    }
}

/// Resolve the concierge config directory (~/.concierge/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".concierge"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.concierge/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<ConciergeConfig, ConfigError> {
    load_config_at(&config_file_path()?)
}

/// Load `.env` from the working directory, then the config at `path`.
pub fn load_config_at(path: &Path) -> Result<ConciergeConfig, ConfigError> {
    let _ = dotenvy::dotenv();
    load_config_from(path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ConciergeConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ConciergeConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ConciergeConfig = json5::from_str(&content)?;
    tracing::debug!(
        instances = config.instances.len(),
        consumers = config.consumers.len(),
        "Loaded config from {}",
        path.display()
    );
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the given path as pretty JSON (a JSON5 subset).
pub fn save_config_to(config: &ConciergeConfig, path: &Path) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Save configuration to the default path.
pub fn save_config(config: &ConciergeConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    save_config_to(config, &dir.join("config.json5"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        agent: { max_iterations: 8 },
        instances: {
            "gmail-work": { type: "gmail", credentials_dir: "creds/work" },
            "tg-personal": {
                type: "telegram",
                account: "me",
                api_id_env: "TG_API_ID",
                framing: "content_length",
            },
        },
        consumers: {
            "inbox": {
                phase: "drafts",
                services: ["gmail-work", "tg-personal"],
            },
            "broken": { services: ["missing"] },
        },
        default_consumer: "inbox",
    }"#;

    #[test]
    fn test_default_config() {
        let config = ConciergeConfig::default();
        assert_eq!(config.default_consumer, "default");
        assert!(config.consumers.contains_key("default"));
        assert_eq!(config.agent.max_iterations, 15);
        assert_eq!(config.agent.token_budget, 50_000);
        assert_eq!(config.servers.handshake_timeout_secs, 30);
        assert_eq!(config.servers.call_timeout_secs, 120);
        assert_eq!(config.model.model, "claude-sonnet-4-6");
    }

    #[test]
    fn test_json5_parse() {
        let config: ConciergeConfig = json5::from_str(SAMPLE).unwrap();
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.agent.token_budget, 50_000);
        assert_eq!(config.instances.len(), 2);
        let tg = &config.instances["tg-personal"];
        assert_eq!(tg.capability, CapabilityType::Telegram);
        assert_eq!(tg.framing, Some(Framing::ContentLength));
        assert_eq!(config.consumers["inbox"].phase, Phase::Drafts);
    }

    #[test]
    fn test_consumer_instances_resolve_keys() {
        let config: ConciergeConfig = json5::from_str(SAMPLE).unwrap();
        let keys: Vec<String> = config
            .consumer_instances("inbox")
            .unwrap()
            .into_iter()
            .map(|r| r.key.to_string())
            .collect();
        assert_eq!(keys, vec!["gmail:gmail-work", "telegram:me"]);
        assert_eq!(
            config.consumer_capabilities("inbox").unwrap(),
            vec![CapabilityType::Gmail, CapabilityType::Telegram]
        );
    }

    #[test]
    fn test_consumer_errors() {
        let config: ConciergeConfig = json5::from_str(SAMPLE).unwrap();
        assert!(matches!(
            config.consumer_instances("nobody"),
            Err(ConfigError::UnknownConsumer(_))
        ));
        assert!(matches!(
            config.consumer_instances("broken"),
            Err(ConfigError::UnknownInstance { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        let config: ConciergeConfig = json5::from_str(SAMPLE).unwrap();
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.default_consumer, "inbox");
        assert_eq!(loaded.instances.len(), 2);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config.default_consumer, "default");
    }
}
