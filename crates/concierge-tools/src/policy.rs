//! Phase-based tool policy.
//!
//! A consumer's phase selects one [`PhasePolicy`]: which public tool names
//! are visible (by prefix, `"*"` for all) and which need operator approval
//! (by exact name). When a consumer sets no policy, one is generated from
//! the capability types it uses.

use concierge_config::ConsumerConfig;
use concierge_types::{CapabilityType, PhasePolicy, ToolPolicy};

use crate::capabilities::{CapabilityMeta, meta};

pub const ALLOW_ALL: &str = "*";

/// Standard three-phase policy for a set of capability types.
///
/// - `read_only`: read tools only, nothing gated
/// - `drafts`: read and write tools, every write tool gated
/// - `controlled`: everything visible, only the dangerous tools gated
pub fn default_tool_policy(capabilities: &[CapabilityType]) -> ToolPolicy {
    let mut read_only = PhasePolicy::default();
    let mut drafts = PhasePolicy::default();
    let mut controlled = PhasePolicy {
        allowed_prefixes: vec![ALLOW_ALL.to_string()],
        requires_approval: Vec::new(),
    };

    for &capability in capabilities {
        let Some(m) = meta(capability) else {
            continue;
        };
        let reads = CapabilityMeta::public(capability, m.read_prefixes);
        let writes = CapabilityMeta::public(capability, m.write_prefixes);

        read_only.allowed_prefixes.extend(reads.iter().cloned());
        drafts.allowed_prefixes.extend(reads);
        for write in writes {
            push_unique(&mut drafts.requires_approval, &write);
            drafts.allowed_prefixes.push(write);
        }
        for tool in CapabilityMeta::public(capability, m.approval_tools) {
            push_unique(&mut controlled.requires_approval, &tool);
        }
    }

    ToolPolicy {
        read_only,
        drafts,
        controlled,
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// The policy in force for a consumer: its own override, or the generated default.
pub fn active_policy(consumer: &ConsumerConfig, capabilities: &[CapabilityType]) -> PhasePolicy {
    let policy = match &consumer.tool_policy {
        Some(policy) => policy.clone(),
        None => {
            tracing::debug!(
                capabilities = capabilities.len(),
                "No tool policy configured, using the generated default"
            );
            default_tool_policy(capabilities)
        }
    };
    policy.for_phase(consumer.phase).clone()
}

pub fn is_allowed(policy: &PhasePolicy, public_name: &str) -> bool {
    policy
        .allowed_prefixes
        .iter()
        .any(|prefix| prefix == ALLOW_ALL || public_name.starts_with(prefix.as_str()))
}

pub fn requires_approval(policy: &PhasePolicy, public_name: &str) -> bool {
    policy.requires_approval.iter().any(|name| name == public_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::Phase;

    #[test]
    fn test_read_only_hides_writes() {
        let policy = default_tool_policy(&[CapabilityType::Gmail, CapabilityType::Telegram]);
        let ro = policy.for_phase(Phase::ReadOnly);
        assert!(is_allowed(ro, "search_emails"));
        assert!(is_allowed(ro, "tg_get_chats"));
        assert!(!is_allowed(ro, "send_email"));
        assert!(!is_allowed(ro, "tg_send_message"));
        assert!(ro.requires_approval.is_empty());
    }

    #[test]
    fn test_drafts_gates_every_write() {
        let policy = default_tool_policy(&[CapabilityType::Gmail]);
        let drafts = policy.for_phase(Phase::Drafts);
        assert!(is_allowed(drafts, "draft_email"));
        assert!(requires_approval(drafts, "draft_email"));
        assert!(requires_approval(drafts, "send_email"));
        assert!(!requires_approval(drafts, "search_emails"));
    }

    #[test]
    fn test_controlled_allows_all_and_gates_dangerous() {
        let policy = default_tool_policy(&[CapabilityType::Gmail, CapabilityType::Slack]);
        let controlled = policy.for_phase(Phase::Controlled);
        assert!(is_allowed(controlled, "anything_at_all"));
        assert!(requires_approval(controlled, "send_email"));
        assert!(requires_approval(controlled, "slack_conversations_add_message"));
        assert!(!requires_approval(controlled, "draft_email"));
        assert!(!requires_approval(controlled, "slack_reactions_add"));
    }

    #[test]
    fn test_only_enabled_capabilities_contribute() {
        let policy = default_tool_policy(&[CapabilityType::Jira]);
        assert_eq!(policy.read_only.allowed_prefixes, vec!["jira_get"]);
        assert!(!is_allowed(&policy.read_only, "search_emails"));
    }

    #[test]
    fn test_consumer_override_wins() {
        let consumer = ConsumerConfig {
            phase: Phase::Drafts,
            tool_policy: Some(ToolPolicy {
                drafts: PhasePolicy {
                    allowed_prefixes: vec!["search_".into()],
                    requires_approval: vec![],
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let active = active_policy(&consumer, &[CapabilityType::Gmail]);
        assert!(is_allowed(&active, "search_emails"));
        assert!(!is_allowed(&active, "draft_email"));
    }

    #[test]
    fn test_consumer_default_policy_follows_phase() {
        let consumer = ConsumerConfig::default();
        let active = active_policy(&consumer, &[CapabilityType::Whatsapp]);
        assert!(is_allowed(&active, "wa_list_chats"));
        assert!(!is_allowed(&active, "wa_send_message"));
    }
}
