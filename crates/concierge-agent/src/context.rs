//! Build the outgoing conversation window from stored history.

use std::sync::Arc;

use tracing::{info, warn};

use concierge_config::ContextConfig;
use concierge_storage::{ConversationStore, StorageError};
use concierge_types::{ContentBlock, ConversationTurn, Role};

use crate::summarizer::Summarizer;

pub const SUMMARY_OPEN: &str = "[Summary of the earlier conversation]";
pub const SUMMARY_CLOSE: &str = "[End of summary, the conversation continues]";
const SUMMARY_ACK: &str = "Understood, continuing.";
const FILLER_USER: &str = "Continue.";
const FILLER_ASSISTANT: &str = "Understood.";

/// Per-turn overhead added to the character estimate.
const TURN_OVERHEAD_TOKENS: usize = 10;

/// Rough token count: one token per three characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 3
}

pub fn estimate_turns_tokens(turns: &[ConversationTurn]) -> usize {
    turns
        .iter()
        .map(|turn| {
            let content: usize = turn
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => estimate_tokens(text),
                    ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
                    ContentBlock::ToolUse { input, .. } => estimate_tokens(&input.to_string()),
                })
                .sum();
            content + TURN_OVERHEAD_TOKENS
        })
        .sum()
}

/// Drop the oldest turns until the estimate fits, always keeping the last two.
pub fn trim_to_budget(mut turns: Vec<ConversationTurn>, max_tokens: usize) -> Vec<ConversationTurn> {
    let mut dropped = 0;
    while turns.len() > 2 && estimate_turns_tokens(&turns) > max_tokens {
        turns.remove(0);
        dropped += 1;
    }
    if dropped > 0 {
        info!(dropped, kept = turns.len(), "Trimmed context to fit budget");
    }
    turns
}

/// Insert filler turns so roles alternate and the first turn is from the user.
pub fn fix_role_alternation(turns: Vec<ConversationTurn>) -> Vec<ConversationTurn> {
    let mut fixed: Vec<ConversationTurn> = Vec::with_capacity(turns.len() + 2);
    for turn in turns {
        if let Some(last) = fixed.last() {
            if last.role == turn.role {
                fixed.push(match turn.role {
                    Role::User => ConversationTurn::assistant(FILLER_ASSISTANT),
                    Role::Assistant => ConversationTurn::user(FILLER_USER),
                });
            }
        }
        fixed.push(turn);
    }
    if fixed.first().is_some_and(|t| t.role != Role::User) {
        fixed.insert(0, ConversationTurn::user(FILLER_USER));
    }
    fixed
}

pub fn summary_turn(summary: &str) -> ConversationTurn {
    ConversationTurn::user(format!("{SUMMARY_OPEN}\n{summary}\n{SUMMARY_CLOSE}"))
}

/// Loads history, folds old turns into a summary, and fits the result to the budget.
pub struct ContextAssembler {
    store: Arc<dyn ConversationStore>,
    summarizer: Option<Summarizer>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        summarizer: Option<Summarizer>,
        config: ContextConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            config,
        }
    }

    /// Turns to send for a new `user_message`, which is appended last.
    pub async fn assemble(
        &self,
        consumer: &str,
        user_message: &str,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let history = self.store.load_history(consumer, self.config.history_limit).await?;

        let mut turns = match &self.summarizer {
            Some(summarizer)
                if self.config.summarize_threshold > 0
                    && history.len() >= self.config.summarize_threshold =>
            {
                self.fold_history(consumer, summarizer, history).await?
            }
            _ => match self.store.load_summary(consumer).await? {
                Some(summary) => {
                    let mut turns = vec![summary_turn(&summary)];
                    if history.first().is_some_and(|t| t.role == Role::User) {
                        turns.push(ConversationTurn::assistant(SUMMARY_ACK));
                    }
                    turns.extend(history);
                    turns
                }
                None => history,
            },
        };

        turns.push(ConversationTurn::user(user_message));
        let turns = fix_role_alternation(turns);
        let turns = trim_to_budget(turns, self.config.max_context_tokens);
        Ok(fix_role_alternation(turns))
    }

    async fn fold_history(
        &self,
        consumer: &str,
        summarizer: &Summarizer,
        history: Vec<ConversationTurn>,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let split = history.len().saturating_sub(self.config.keep_recent);
        let (old, recent) = history.split_at(split);
        if old.is_empty() {
            return Ok(history);
        }

        info!(
            consumer,
            old = old.len(),
            recent = recent.len(),
            "Summarizing conversation history"
        );
        let summary = match summarizer.summarize(old).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(consumer, error = %e, "Summarization failed, keeping history as is");
                return Ok(history);
            }
        };
        self.store.save_summary(consumer, &summary).await?;

        let mut turns = vec![summary_turn(&summary)];
        if recent.first().is_some_and(|t| t.role == Role::User) {
            turns.push(ConversationTurn::assistant(SUMMARY_ACK));
        }
        turns.extend_from_slice(recent);
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use concierge_storage::MemoryStore;

    fn alternating(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationTurn::user(format!("u{i}"))
                } else {
                    ConversationTurn::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    fn roles(turns: &[ConversationTurn]) -> Vec<Role> {
        turns.iter().map(|t| t.role).collect()
    }

    #[test]
    fn test_estimate() {
        assert_eq!(estimate_tokens("abcdef"), 2);
        let turns = vec![ConversationTurn::user("abcdef"), ConversationTurn::assistant("")];
        assert_eq!(estimate_turns_tokens(&turns), 2 + 10 + 10);
    }

    #[test]
    fn test_trim_keeps_last_two() {
        let turns: Vec<_> = (0..6).map(|_| ConversationTurn::user("x".repeat(300))).collect();
        let trimmed = trim_to_budget(turns.clone(), 0);
        assert_eq!(trimmed.len(), 2);

        let untouched = trim_to_budget(turns, 10_000);
        assert_eq!(untouched.len(), 6);
    }

    #[test]
    fn test_trim_drops_oldest_first() {
        let turns = alternating(4);
        // each turn: 0 content tokens + 10 overhead
        let trimmed = trim_to_budget(turns, 25);
        assert_eq!(trimmed[0].text(), "u2");
    }

    #[test]
    fn test_alternation_fillers() {
        let turns = vec![
            ConversationTurn::assistant("hello"),
            ConversationTurn::user("a"),
            ConversationTurn::user("b"),
            ConversationTurn::assistant("c"),
            ConversationTurn::assistant("d"),
        ];
        let fixed = fix_role_alternation(turns);
        assert_eq!(
            roles(&fixed),
            vec![
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
            ]
        );
        assert_eq!(fixed[0].text(), FILLER_USER);
        assert_eq!(fixed[3].text(), FILLER_ASSISTANT);
    }

    #[tokio::test]
    async fn test_assemble_short_history() {
        let store = Arc::new(MemoryStore::new());
        store.append_turns("c", &alternating(4)).await.unwrap();
        let assembler = ContextAssembler::new(store, None, ContextConfig::default());

        let turns = assembler.assemble("c", "next").await.unwrap();
        assert_eq!(turns.len(), 5);
        assert_eq!(turns.last().unwrap().text(), "next");
    }

    #[tokio::test]
    async fn test_assemble_summarizes_long_history() {
        let store = Arc::new(MemoryStore::new());
        store.append_turns("c", &alternating(20)).await.unwrap();
        let model = Arc::new(ScriptedModel::new().then_text("- facts"));
        let summarizer = Summarizer::new(model.clone(), "claude-haiku-4-5", 500);
        let assembler = ContextAssembler::new(store.clone(), Some(summarizer), ContextConfig::default());

        let turns = assembler.assemble("c", "next").await.unwrap();
        assert!(turns[0].text().starts_with(SUMMARY_OPEN));
        assert!(turns[0].text().contains("- facts"));
        // summary, ack, 10 recent, new message
        assert_eq!(turns.len(), 13);
        assert_eq!(turns[1].text(), SUMMARY_ACK);
        assert_eq!(turns[2].text(), "u10");
        assert_eq!(store.load_summary("c").await.unwrap().as_deref(), Some("- facts"));
        assert!(model.requests()[0].turns[0].text().contains("u0"));
    }

    #[tokio::test]
    async fn test_summarizer_failure_keeps_history() {
        let store = Arc::new(MemoryStore::new());
        store.append_turns("c", &alternating(20)).await.unwrap();
        let model = Arc::new(ScriptedModel::new().then_error(429));
        let summarizer = Summarizer::new(model, "m", 500);
        let assembler = ContextAssembler::new(store.clone(), Some(summarizer), ContextConfig::default());

        let turns = assembler.assemble("c", "next").await.unwrap();
        assert_eq!(turns.len(), 21);
        assert_eq!(turns[0].text(), "u0");
        assert!(store.load_summary("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stored_summary_prepended() {
        let store = Arc::new(MemoryStore::new());
        store.save_summary("c", "- old facts").await.unwrap();
        store.append_turns("c", &alternating(2)).await.unwrap();
        let assembler = ContextAssembler::new(store, None, ContextConfig::default());

        let turns = assembler.assemble("c", "next").await.unwrap();
        assert!(turns[0].text().contains("- old facts"));
        assert_eq!(
            roles(&turns),
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
    }
}
