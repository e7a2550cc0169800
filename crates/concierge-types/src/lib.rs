use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ──────────────────── Capability Types ────────────────────

/// The closed set of external capability servers the gateway knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Gmail,
    Calendar,
    Telegram,
    Whatsapp,
    Slack,
    Confluence,
    Jira,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 7] = [
        CapabilityType::Gmail,
        CapabilityType::Calendar,
        CapabilityType::Telegram,
        CapabilityType::Whatsapp,
        CapabilityType::Slack,
        CapabilityType::Confluence,
        CapabilityType::Jira,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Gmail => "gmail",
            CapabilityType::Calendar => "calendar",
            CapabilityType::Telegram => "telegram",
            CapabilityType::Whatsapp => "whatsapp",
            CapabilityType::Slack => "slack",
            CapabilityType::Confluence => "confluence",
            CapabilityType::Jira => "jira",
        }
    }

    /// Prefix always prepended to the server's tool names.
    ///
    /// Servers whose upstream tool names are generic (`send_message`,
    /// `get_chats`) get a short namespace so two messaging servers can share
    /// one catalog.
    pub fn namespace_prefix(&self) -> &'static str {
        match self {
            CapabilityType::Telegram => "tg_",
            CapabilityType::Whatsapp => "wa_",
            CapabilityType::Slack => "slack_",
            CapabilityType::Gmail
            | CapabilityType::Calendar
            | CapabilityType::Confluence
            | CapabilityType::Jira => "",
        }
    }

    /// Prefix applied on top of the namespace prefix when a public name still
    /// collides with another capability type's tool.
    pub fn collision_prefix(&self) -> String {
        format!("{}_", self.as_str())
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown capability type: {s}"))
    }
}

/// Identifies one runnable server process: capability type plus the account
/// or workspace it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub capability: CapabilityType,
    pub account: String,
}

impl InstanceKey {
    pub fn new(capability: CapabilityType, account: impl Into<String>) -> Self {
        Self {
            capability,
            account: account.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.capability, self.account)
    }
}

impl FromStr for InstanceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (capability, account) = s
            .split_once(':')
            .ok_or_else(|| format!("instance key must look like type:account, got {s}"))?;
        Ok(Self::new(capability.parse()?, account))
    }
}

// ──────────────────── Launch Types ────────────────────

/// Message framing used on a server's stdio channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON document per line.
    #[default]
    Newline,
    /// `Content-Length: N\r\n\r\n` header followed by N bytes of JSON.
    ContentLength,
}

/// Everything needed to spawn one capability server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub capability: CapabilityType,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub framing: Framing,
}

impl LaunchSpec {
    pub fn new(capability: CapabilityType, command: impl Into<String>) -> Self {
        Self {
            capability,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            framing: Framing::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Command line as a single display string, for status output.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ──────────────────── Conversation Types ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One block of turn content, shaped like the model API's content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Token counts reported by the model for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }
}

/// A role-tagged unit of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ConversationTurn {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            usage: TokenUsage::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// Concatenated text blocks, ignoring tool blocks.
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

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    pub fn has_tool_uses(&self) -> bool {
        self.tool_uses().next().is_some()
    }
}

// ──────────────────── Tool Types ────────────────────

/// A tool definition as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
}

// ──────────────────── Policy Types ────────────────────

/// Rollout phase of a consumer. Each phase selects one [`PhasePolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    ReadOnly,
    Drafts,
    Controlled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ReadOnly => "read_only",
            Phase::Drafts => "drafts",
            Phase::Controlled => "controlled",
        }
    }
}

/// Tools visible in one phase, and the subset that needs operator approval.
///
/// `allowed_prefixes` matches public tool names by prefix; `"*"` allows
/// everything. `requires_approval` lists exact public names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePolicy {
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    #[serde(default)]
    pub requires_approval: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub read_only: PhasePolicy,
    #[serde(default)]
    pub drafts: PhasePolicy,
    #[serde(default)]
    pub controlled: PhasePolicy,
}

impl ToolPolicy {
    pub fn for_phase(&self, phase: Phase) -> &PhasePolicy {
        match phase {
            Phase::ReadOnly => &self.read_only,
            Phase::Drafts => &self.drafts,
            Phase::Controlled => &self.controlled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_serde() {
        assert_eq!(serde_json::to_string(&Phase::ReadOnly).unwrap(), "\"read_only\"");
        let policy: ToolPolicy =
            serde_json::from_str(r#"{"drafts": {"allowed_prefixes": ["get_"]}}"#).unwrap();
        assert_eq!(policy.for_phase(Phase::Drafts).allowed_prefixes, vec!["get_"]);
        assert!(policy.for_phase(Phase::Controlled).allowed_prefixes.is_empty());
    }

    #[test]
    fn test_capability_prefixes() {
        assert_eq!(CapabilityType::Telegram.namespace_prefix(), "tg_");
        assert_eq!(CapabilityType::Gmail.namespace_prefix(), "");
        assert_eq!(CapabilityType::Jira.collision_prefix(), "jira_");
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!("slack".parse::<CapabilityType>(), Ok(CapabilityType::Slack));
        assert!("fax".parse::<CapabilityType>().is_err());
    }

    #[test]
    fn test_instance_key_display_and_parse() {
        let key = InstanceKey::new(CapabilityType::Gmail, "work");
        assert_eq!(key.to_string(), "gmail:work");
        assert_eq!("gmail:work".parse::<InstanceKey>().unwrap(), key);
        assert!("gmail".parse::<InstanceKey>().is_err());
    }

    #[test]
    fn test_launch_spec_defaults() {
        let json = r#"{"capability": "slack", "command": "npx"}"#;
        let spec: LaunchSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.framing, Framing::Newline);
        assert!(spec.args.is_empty());
        assert_eq!(spec.command_line(), "npx");
    }

    #[test]
    fn test_content_block_serde() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "search_emails".into(),
            input: json!({"query": "invoice"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");

        let ok = serde_json::to_value(ContentBlock::tool_result("tu_1", "done")).unwrap();
        assert!(ok.get("is_error").is_none());
        let err = serde_json::to_value(ContentBlock::tool_error("tu_1", "boom")).unwrap();
        assert_eq!(err["is_error"], true);
    }

    #[test]
    fn test_turn_helpers() {
        let turn = ConversationTurn::new(
            Role::Assistant,
            vec![
                ContentBlock::text("Let me check."),
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "tg_get_chats".into(),
                    input: json!({}),
                },
            ],
        );
        assert_eq!(turn.text(), "Let me check.");
        assert!(turn.has_tool_uses());
        assert!(!ConversationTurn::user("hi").has_tool_uses());
    }

    #[test]
    fn test_usage_total() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        usage.add(&TokenUsage {
            cache_read_input_tokens: 3,
            ..Default::default()
        });
        assert_eq!(usage.total(), 18);
    }
}
