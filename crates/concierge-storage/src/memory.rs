use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use concierge_types::ConversationTurn;

use crate::{ApprovalStatus, ConversationStore, PendingApproval, Result, ToolCallRecord};

#[derive(Default)]
struct Tables {
    turns: HashMap<String, Vec<ConversationTurn>>,
    summaries: HashMap<String, String>,
    approvals: HashMap<String, PendingApproval>,
    tool_calls: Vec<ToolCallRecord>,
}

/// Process-local [`ConversationStore`]; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_history(&self, consumer: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let tables = self.tables.lock().await;
        let turns = tables.turns.get(consumer).map(Vec::as_slice).unwrap_or_default();
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }

    async fn append_turns(&self, consumer: &str, turns: &[ConversationTurn]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .turns
            .entry(consumer.to_string())
            .or_default()
            .extend_from_slice(turns);
        Ok(())
    }

    async fn clear_history(&self, consumer: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.turns.remove(consumer);
        tables.summaries.remove(consumer);
        Ok(())
    }

    async fn load_summary(&self, consumer: &str) -> Result<Option<String>> {
        Ok(self.tables.lock().await.summaries.get(consumer).cloned())
    }

    async fn save_summary(&self, consumer: &str, summary: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .summaries
            .insert(consumer.to_string(), summary.to_string());
        Ok(())
    }

    async fn save_pending_approval(&self, approval: &PendingApproval) -> Result<()> {
        self.tables
            .lock()
            .await
            .approvals
            .insert(approval.request_id.clone(), approval.clone());
        Ok(())
    }

    async fn load_pending_approval(&self, request_id: &str) -> Result<Option<PendingApproval>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .approvals
            .get(request_id)
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned())
    }

    async fn resolve_pending_approval(
        &self,
        request_id: &str,
        status: ApprovalStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.approvals.get_mut(request_id) {
            Some(approval) if approval.status == ApprovalStatus::Pending => {
                approval.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn log_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        let mut record = record.clone();
        record.result = record.truncated_result();
        self.tables.lock().await.tool_calls.push(record);
        Ok(())
    }

    async fn recent_tool_calls(&self, consumer: &str, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tool_calls
            .iter()
            .rev()
            .filter(|r| r.consumer == consumer)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_limit_keeps_newest() {
        let store = MemoryStore::new();
        let turns: Vec<_> = (0..4).map(|i| ConversationTurn::user(format!("m{i}"))).collect();
        store.append_turns("c", &turns).await.unwrap();
        let history = store.load_history("c", 2).await.unwrap();
        assert_eq!(history[0].text(), "m2");
        assert_eq!(history[1].text(), "m3");
        assert!(store.load_history("nobody", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_only_pending() {
        let store = MemoryStore::new();
        store
            .save_pending_approval(&PendingApproval {
                request_id: "r".into(),
                consumer: "c".into(),
                tool_use_id: "t".into(),
                tool_name: "send_email".into(),
                arguments: serde_json::json!({}),
                snapshot: vec![],
                status: ApprovalStatus::Pending,
                created_at: 0,
            })
            .await
            .unwrap();
        assert!(store.resolve_pending_approval("r", ApprovalStatus::Expired).await.unwrap());
        assert!(!store.resolve_pending_approval("r", ApprovalStatus::Approved).await.unwrap());
        assert!(store.load_pending_approval("r").await.unwrap().is_none());
    }
}
