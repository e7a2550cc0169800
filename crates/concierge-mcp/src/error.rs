use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("capability server '{server}' failed to start: {reason}")]
    Startup { server: String, reason: String },
    #[error("capability server '{server}' is misconfigured: {reason}")]
    Launch { server: String, reason: String },
    #[error("capability server '{server}' sent a malformed message: {reason}")]
    Protocol { server: String, reason: String },
    #[error("tool '{tool}' failed: {}", payload_text(.payload))]
    ToolExecution { tool: String, payload: Value },
    #[error("capability server '{server}' did not answer {method} within {timeout:?}")]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },
    #[error("connection to capability server '{server}' was lost")]
    ProcessLost { server: String },
    #[error("tool name '{name}' is exposed by both {first} and {second}")]
    CatalogConflict {
        name: String,
        first: String,
        second: String,
    },
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl McpError {
    /// Errors the operator has to fix. Everything else is fed back to the model.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            McpError::Startup { .. } | McpError::Launch { .. } | McpError::CatalogConflict { .. }
        )
    }

    pub fn is_process_lost(&self) -> bool {
        matches!(self, McpError::ProcessLost { .. })
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => match map.get("code").and_then(Value::as_i64) {
                Some(code) => format!("{message} (code {code})"),
                None => message.to_string(),
            },
            None => payload.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_execution_display() {
        let err = McpError::ToolExecution {
            tool: "send_email".into(),
            payload: json!({"code": -32602, "message": "missing 'to'"}),
        };
        assert_eq!(err.to_string(), "tool 'send_email' failed: missing 'to' (code -32602)");

        let err = McpError::ToolExecution {
            tool: "get_chats".into(),
            payload: json!("rate limited"),
        };
        assert_eq!(err.to_string(), "tool 'get_chats' failed: rate limited");
    }

    #[test]
    fn test_operational_classification() {
        assert!(McpError::Startup { server: "x".into(), reason: "y".into() }.is_operational());
        assert!(!McpError::UnknownTool("x".into()).is_operational());
        assert!(!McpError::ProcessLost { server: "x".into() }.is_operational());
    }
}
