//! Hook event types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    /// A tool call is about to be dispatched.
    ToolCallBefore {
        consumer: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// A tool call finished (or was rejected).
    ToolCallAfter {
        consumer: String,
        tool_name: String,
        is_error: bool,
        latency_ms: u64,
    },
    /// A gated tool call is waiting for an operator decision.
    ApprovalRequested {
        request_id: String,
        consumer: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ApprovalResolved {
        request_id: String,
        approved: bool,
    },
    /// A run ended; `reason` is the loop's termination reason.
    RunFinished {
        consumer: String,
        reason: String,
        iterations: u32,
        tokens: u64,
    },
}

impl HookEvent {
    /// Routing name used by [`crate::HookRegistry::on`].
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::ToolCallBefore { .. } => "tool_call_before",
            HookEvent::ToolCallAfter { .. } => "tool_call_after",
            HookEvent::ApprovalRequested { .. } => "approval_requested",
            HookEvent::ApprovalResolved { .. } => "approval_resolved",
            HookEvent::RunFinished { .. } => "run_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_tag_matches_name() {
        let event = HookEvent::ApprovalResolved {
            request_id: "r1".into(),
            approved: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
    }
}
