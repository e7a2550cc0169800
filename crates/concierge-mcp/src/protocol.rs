//! JSON-RPC message shapes spoken by capability servers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Method-not-found error code for server-initiated requests we do not handle.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Classified inbound message.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests.
    Response { id: u64, reply: Reply },
    /// Request originated by the server.
    Request { id: Value, method: String },
    Notification { method: String },
    /// Valid JSON that is none of the above, or a response with an id we never issued.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error(Value),
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "concierge",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {},
    })
}

pub fn call_params(tool: &str, arguments: Value) -> Value {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    json!({ "name": tool, "arguments": arguments })
}

pub fn classify(message: Value) -> Inbound {
    let method = message.get("method").and_then(Value::as_str).map(str::to_string);
    match (message.get("id"), method) {
        (Some(id), Some(method)) => Inbound::Request {
            id: id.clone(),
            method,
        },
        (None, Some(method)) => Inbound::Notification { method },
        (Some(id), None) => {
            let Some(id) = response_id(id) else {
                return Inbound::Unknown;
            };
            let reply = match message.get("error") {
                Some(error) => Reply::Error(error.clone()),
                None => Reply::Result(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            Inbound::Response { id, reply }
        }
        (None, None) => Inbound::Unknown,
    }
}

/// Our ids are integers; some servers echo them back as strings.
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn parse_tool_list(result: &Value) -> Result<Vec<RemoteTool>, String> {
    let tools = result
        .get("tools")
        .ok_or_else(|| "tools/list result has no 'tools' field".to_string())?;
    serde_json::from_value(tools.clone()).map_err(|e| format!("invalid tool list: {e}"))
}

/// Flattened `tools/call` result.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub text: String,
    pub is_error: bool,
}

impl CallOutcome {
    /// Collapse the result's content blocks into text, keeping placeholders
    /// for binary content the model cannot see.
    pub fn from_result(result: &Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let blocks = result.get("content").and_then(Value::as_array);
        let text = match blocks {
            Some(blocks) if !blocks.is_empty() => blocks
                .iter()
                .filter_map(block_text)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => match result.get("structuredContent") {
                Some(structured) => structured.to_string(),
                None => String::new(),
            },
        };

        Self { text, is_error }
    }
}

fn block_text(block: &Value) -> Option<String> {
    let kind = block.get("type").and_then(Value::as_str)?;
    let field = |name: &str| block.get(name).and_then(Value::as_str).unwrap_or("");
    match kind {
        "text" => Some(field("text").to_string()),
        "image" => Some(format!("[Image: {}]", field("mimeType"))),
        "audio" => Some(format!("[Audio: {}]", field("mimeType"))),
        "resource_link" => Some(format!("[ResourceLink: {}]", field("uri"))),
        "resource" => {
            let resource = block.get("resource")?;
            let uri = resource.get("uri").and_then(Value::as_str).unwrap_or("");
            match resource.get("text").and_then(Value::as_str) {
                Some(text) => Some(format!("[Resource: {uri}]\n{text}")),
                None => Some(format!("[Resource: {uri}]")),
            }
        }
        _ => None,
    }
}
