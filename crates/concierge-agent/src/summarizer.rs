//! Condense old conversation turns with a small model.

use std::sync::Arc;

use concierge_config::ContextConfig;
use concierge_types::{ContentBlock, ConversationTurn, Role};

use crate::model::{ModelClient, ModelError, ModelRequest};

const SUMMARY_PROMPT: &str = "Condense the following conversation into a short summary.
Always keep:
- Every email address, phone number and link
- Names of people and companies, their roles and the language they use
- Concrete dates, times and time zones
- Actions that were actually performed (emails sent, events created), with details
- Agreements and preferences the user stated

Format: 5-15 bullet points, each one concrete sentence of facts. No preamble.
Reply with the list only.";

const MAX_TURN_CHARS: usize = 500;
const MAX_TOOL_RESULT_CHARS: usize = 200;

pub struct Summarizer {
    client: Arc<dyn ModelClient>,
    model: String,
    max_tokens: u32,
}

impl Summarizer {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn from_config(client: Arc<dyn ModelClient>, config: &ContextConfig) -> Self {
        Self::new(client, config.summarizer_model.clone(), config.summarizer_max_tokens)
    }

    pub async fn summarize(&self, turns: &[ConversationTurn]) -> Result<String, ModelError> {
        let transcript = format_transcript(turns);
        let response = self
            .client
            .complete(ModelRequest {
                model: self.model.clone(),
                system: SUMMARY_PROMPT.to_string(),
                turns: vec![ConversationTurn::user(transcript)],
                tools: Vec::new(),
                allow_tools: false,
                max_tokens: self.max_tokens,
                cache_hints: false,
            })
            .await?;
        let summary = response.text().trim().to_string();
        if summary.is_empty() {
            return Err(ModelError::Decode("summarizer returned no text".into()));
        }
        Ok(summary)
    }
}

/// Plain-text transcript of `turns` for the summarizer.
pub fn format_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .filter_map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let parts: Vec<String> = turn
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolUse { name, .. } => format!("[Call: {name}]"),
                    ContentBlock::ToolResult { content, .. } => {
                        let head: String = content.chars().take(MAX_TOOL_RESULT_CHARS).collect();
                        format!("[Tool result: {head}]")
                    }
                })
                .collect();
            let mut text = parts.join("\n");
            if text.is_empty() {
                return None;
            }
            if text.chars().count() > MAX_TURN_CHARS {
                text = text.chars().take(MAX_TURN_CHARS).collect::<String>() + "...";
            }
            Some(format!("{speaker}: {text}"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use serde_json::json;

    #[test]
    fn test_transcript_shapes() {
        let turns = vec![
            ConversationTurn::user("who wrote?"),
            ConversationTurn::new(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "search_emails".into(),
                    input: json!({}),
                }],
            ),
            ConversationTurn::new(Role::User, vec![ContentBlock::tool_result("t1", "x".repeat(300))]),
            ConversationTurn::assistant("y".repeat(600)),
        ];
        let text = format_transcript(&turns);
        let parts: Vec<&str> = text.split("\n\n").collect();
        assert_eq!(parts[0], "User: who wrote?");
        assert_eq!(parts[1], "Assistant: [Call: search_emails]");
        assert_eq!(parts[2], format!("User: [Tool result: {}]", "x".repeat(200)));
        assert!(parts[3].ends_with("..."));
        assert_eq!(parts[3].chars().count(), "Assistant: ".len() + 500 + 3);
    }

    #[tokio::test]
    async fn test_summarize_uses_small_model_without_tools() {
        let model = Arc::new(ScriptedModel::new().then_text("- met Bob"));
        let summarizer = Summarizer::new(model.clone(), "claude-haiku-4-5", 500);
        let summary = summarizer.summarize(&[ConversationTurn::user("hi")]).await.unwrap();
        assert_eq!(summary, "- met Bob");

        let requests = model.requests();
        assert_eq!(requests[0].model, "claude-haiku-4-5");
        assert!(requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_empty_summary_is_an_error() {
        let model = Arc::new(ScriptedModel::new().then_text("   "));
        let summarizer = Summarizer::new(model, "m", 10);
        assert!(summarizer.summarize(&[ConversationTurn::user("hi")]).await.is_err());
    }
}
