//! Static metadata for each capability type.
//!
//! Tool names here are the servers' *original* names; the namespace prefix
//! is applied by [`CapabilityMeta::public`] when building policies.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use concierge_types::CapabilityType;

#[derive(Debug)]
pub struct CapabilityMeta {
    pub display_name: &'static str,
    pub description: &'static str,
    /// Name prefixes of tools that only read.
    pub read_prefixes: &'static [&'static str],
    /// Name prefixes of tools that change state.
    pub write_prefixes: &'static [&'static str],
    /// Write tools that need operator approval even in the `controlled` phase.
    pub approval_tools: &'static [&'static str],
}

pub static CAPABILITIES: Lazy<HashMap<CapabilityType, CapabilityMeta>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        CapabilityType::Gmail,
        CapabilityMeta {
            display_name: "Gmail",
            description: "Search and read email through Gmail",
            read_prefixes: &[
                "search_emails",
                "read_email",
                "list_email_labels",
                "list_filters",
                "get_filter",
                "download_attachment",
            ],
            write_prefixes: &[
                "draft_email",
                "send_email",
                "modify_email",
                "delete_email",
                "batch_modify_emails",
                "batch_delete_emails",
                "create_label",
                "update_label",
                "delete_label",
                "get_or_create_label",
                "create_filter",
                "delete_filter",
            ],
            approval_tools: &[
                "send_email",
                "delete_email",
                "modify_email",
                "batch_modify_emails",
                "batch_delete_emails",
            ],
        },
    );
    m.insert(
        CapabilityType::Calendar,
        CapabilityMeta {
            display_name: "Google Calendar",
            description: "Manage Google Calendar events",
            read_prefixes: &[
                "list-events",
                "search-events",
                "get-event",
                "list-calendars",
                "list-colors",
                "get-freebusy",
                "get-current-time",
            ],
            write_prefixes: &[
                "create-event",
                "update-event",
                "delete-event",
                "respond-to-event",
                "manage-accounts",
            ],
            approval_tools: &["update-event", "delete-event", "respond-to-event"],
        },
    );
    m.insert(
        CapabilityType::Telegram,
        CapabilityMeta {
            display_name: "Telegram",
            description: "Read and send messages in Telegram chats",
            read_prefixes: &["get_", "list_", "search_", "resolve_", "export_contacts"],
            write_prefixes: &[
                "send_", "reply_", "edit_", "delete_", "forward_", "create_", "pin_", "unpin_",
                "mark_", "ban_", "unban_", "promote_", "demote_", "invite_", "leave_", "join_",
                "subscribe_", "import_", "block_", "unblock_", "save_", "clear_", "set_",
                "update_", "mute_", "unmute_", "archive_", "unarchive_", "add_", "remove_",
                "reorder_", "press_", "export_chat_invite",
            ],
            approval_tools: &[
                "send_message",
                "delete_message",
                "ban_user",
                "leave_chat",
                "create_group",
                "create_channel",
                "forward_message",
                "block_user",
                "promote_admin",
                "demote_admin",
            ],
        },
    );
    m.insert(
        CapabilityType::Whatsapp,
        CapabilityMeta {
            display_name: "WhatsApp",
            description: "Read and send WhatsApp messages",
            read_prefixes: &[
                "search_contacts",
                "list_messages",
                "list_chats",
                "get_chat",
                "get_message_context",
                "search_messages",
            ],
            write_prefixes: &["send_message"],
            approval_tools: &["send_message"],
        },
    );
    m.insert(
        CapabilityType::Slack,
        CapabilityMeta {
            display_name: "Slack",
            description: "Read channels, search messages and post to Slack",
            read_prefixes: &[
                "conversations_history",
                "conversations_replies",
                "conversations_search_messages",
                "channels_list",
                "users_search",
                "usergroups_list",
                "usergroups_me",
                "attachment_get_data",
            ],
            write_prefixes: &[
                "conversations_add_message",
                "reactions_add",
                "reactions_remove",
                "usergroups_create",
                "usergroups_update",
                "usergroups_users_update",
            ],
            approval_tools: &[
                "conversations_add_message",
                "usergroups_create",
                "usergroups_update",
                "usergroups_users_update",
            ],
        },
    );
    m.insert(
        CapabilityType::Confluence,
        CapabilityMeta {
            display_name: "Confluence",
            description: "Search and read Confluence Cloud pages",
            read_prefixes: &["conf_get"],
            write_prefixes: &["conf_post", "conf_put", "conf_patch", "conf_delete"],
            approval_tools: &["conf_post", "conf_put", "conf_patch", "conf_delete"],
        },
    );
    m.insert(
        CapabilityType::Jira,
        CapabilityMeta {
            display_name: "Jira",
            description: "Search and manage Jira Cloud issues",
            read_prefixes: &["jira_get"],
            write_prefixes: &["jira_post", "jira_put", "jira_patch", "jira_delete"],
            approval_tools: &["jira_post", "jira_put", "jira_patch", "jira_delete"],
        },
    );
    m
});

/// Metadata for `capability`. Every variant has an entry.
pub fn meta(capability: CapabilityType) -> Option<&'static CapabilityMeta> {
    CAPABILITIES.get(&capability)
}

impl CapabilityMeta {
    /// Prefix `names` with the capability's namespace.
    pub fn public(capability: CapabilityType, names: &[&str]) -> Vec<String> {
        let prefix = capability.namespace_prefix();
        names.iter().map(|n| format!("{prefix}{n}")).collect()
    }
}
