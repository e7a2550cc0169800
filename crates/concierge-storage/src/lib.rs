//! concierge-storage: persistence for conversations, summaries, pending
//! approvals and the tool-call log.
//!
//! [`ConversationStore`] is the boundary the agent talks to. [`SqliteStore`]
//! is the on-disk implementation; [`MemoryStore`] backs tests and runs
//! without a database.

mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use concierge_types::ConversationTurn;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Stored tool results are cut to this many characters.
pub const TOOL_LOG_MAX_CHARS: usize = 10_240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            "expired" => ApprovalStatus::Expired,
            _ => ApprovalStatus::Pending,
        }
    }
}

/// A gated tool call waiting for an operator decision.
///
/// `snapshot` is the conversation up to and including the assistant turn
/// that requested the call, so the run can be resumed after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request_id: String,
    pub consumer: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub snapshot: Vec<ConversationTurn>,
    pub status: ApprovalStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub consumer: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: String,
    pub is_error: bool,
    pub latency_ms: u64,
    pub model: String,
}

impl ToolCallRecord {
    fn truncated_result(&self) -> String {
        if self.result.chars().count() <= TOOL_LOG_MAX_CHARS {
            return self.result.clone();
        }
        let cut: String = self.result.chars().take(TOOL_LOG_MAX_CHARS).collect();
        format!("{cut}...[truncated]")
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The last `limit` turns for a consumer, oldest first.
    async fn load_history(&self, consumer: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    async fn append_turns(&self, consumer: &str, turns: &[ConversationTurn]) -> Result<()>;

    async fn clear_history(&self, consumer: &str) -> Result<()>;

    /// The most recently saved summary.
    async fn load_summary(&self, consumer: &str) -> Result<Option<String>>;

    async fn save_summary(&self, consumer: &str, summary: &str) -> Result<()>;

    async fn save_pending_approval(&self, approval: &PendingApproval) -> Result<()>;

    /// Only returns approvals still in `Pending`.
    async fn load_pending_approval(&self, request_id: &str) -> Result<Option<PendingApproval>>;

    /// Move a pending approval to `status`. Returns `false` if it was not
    /// pending (unknown id or already resolved).
    async fn resolve_pending_approval(&self, request_id: &str, status: ApprovalStatus)
    -> Result<bool>;

    async fn log_tool_call(&self, record: &ToolCallRecord) -> Result<()>;

    /// Newest first.
    async fn recent_tool_calls(&self, consumer: &str, limit: usize) -> Result<Vec<ToolCallRecord>>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
