use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use concierge_agent::AgentRuntime;
use concierge_hooks::{HookEvent, HookHandler};

/// An approval request announced by a run.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub consumer: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ApprovalRequest {
    pub fn describe(&self) -> String {
        format!(
            "[{}] {} wants to call {} with {}",
            self.request_id, self.consumer, self.tool_name, self.arguments
        )
    }
}

/// Forward every `approval_requested` event from `runtime` into a channel.
pub async fn subscribe(runtime: &Arc<AgentRuntime>) -> mpsc::UnboundedReceiver<ApprovalRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: HookHandler = Arc::new(move |event: HookEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            if let HookEvent::ApprovalRequested {
                request_id,
                consumer,
                tool_name,
                arguments,
            } = event
            {
                let _ = tx.send(ApprovalRequest {
                    request_id,
                    consumer,
                    tool_name,
                    arguments,
                });
            }
        })
    });
    runtime.hooks().on("approval_requested", handler).await;
    rx
}

/// Ask on the terminal. Anything but `y`/`yes` rejects.
pub async fn prompt(request: &ApprovalRequest) -> Result<bool> {
    let question = format!("{}\nApprove? [y/N] ", request.describe());
    let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut stderr = io::stderr();
        stderr.write_all(question.as_bytes())?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
