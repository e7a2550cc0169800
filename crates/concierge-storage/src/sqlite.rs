use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use concierge_types::{ConversationTurn, Role, TokenUsage};

use crate::{
    ApprovalStatus, ConversationStore, PendingApproval, Result, ToolCallRecord, now_millis,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens_input INTEGER DEFAULT 0,
    tokens_output INTEGER DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_consumer ON conversations(consumer, id);

CREATE TABLE IF NOT EXISTS conversation_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_requests (
    request_id TEXT PRIMARY KEY,
    consumer TEXT NOT NULL,
    tool_use_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
);

CREATE TABLE IF NOT EXISTS tool_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT,
    result TEXT,
    model TEXT NOT NULL,
    latency_ms INTEGER DEFAULT 0,
    is_error INTEGER DEFAULT 0,
    created_at INTEGER NOT NULL
);
";

/// SQLite-backed [`ConversationStore`]. Every query runs on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %path.display(), "storage opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_role(s: &str) -> Role {
    if s == "assistant" {
        Role::Assistant
    } else {
        Role::User
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load_history(&self, consumer: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<(String, String, u64, u64)>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT role, content, tokens_input, tokens_output FROM conversations
                 WHERE consumer = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![consumer, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await??;

        rows.into_iter()
            .rev()
            .map(|(role, content, input, output)| -> Result<ConversationTurn> {
                Ok(ConversationTurn {
                    role: parse_role(&role),
                    content: serde_json::from_str(&content)?,
                    usage: TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                        ..Default::default()
                    },
                })
            })
            .collect()
    }

    async fn append_turns(&self, consumer: &str, turns: &[ConversationTurn]) -> Result<()> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        let rows = turns
            .iter()
            .map(|turn| -> Result<(&'static str, String, i64, i64)> {
                Ok((
                    turn.role.as_str(),
                    serde_json::to_string(&turn.content)?,
                    turn.usage.input_tokens as i64,
                    turn.usage.output_tokens as i64,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let now = now_millis();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            for (role, content, input, output) in rows {
                tx.execute(
                    "INSERT INTO conversations
                        (consumer, role, content, tokens_input, tokens_output, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![consumer, role, content, input, output, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn clear_history(&self, consumer: &str) -> Result<()> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM conversations WHERE consumer = ?1",
                rusqlite::params![consumer],
            )?;
            conn.execute(
                "DELETE FROM conversation_summaries WHERE consumer = ?1",
                rusqlite::params![consumer],
            )?;
            Ok(())
        })
        .await?
    }

    async fn load_summary(&self, consumer: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let summary = conn
                .query_row(
                    "SELECT summary FROM conversation_summaries
                     WHERE consumer = ?1 ORDER BY id DESC LIMIT 1",
                    rusqlite::params![consumer],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(summary)
        })
        .await?
    }

    async fn save_summary(&self, consumer: &str, summary: &str) -> Result<()> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        let summary = summary.to_string();
        let now = now_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO conversation_summaries (consumer, summary, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![consumer, summary, now],
            )?;
            Ok(())
        })
        .await?
    }

    async fn save_pending_approval(&self, approval: &PendingApproval) -> Result<()> {
        let conn = self.conn.clone();
        let arguments = serde_json::to_string(&approval.arguments)?;
        let snapshot = serde_json::to_string(&approval.snapshot)?;
        let approval = approval.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO approval_requests
                    (request_id, consumer, tool_use_id, tool_name, arguments, snapshot, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    approval.request_id,
                    approval.consumer,
                    approval.tool_use_id,
                    approval.tool_name,
                    arguments,
                    snapshot,
                    approval.status.as_str(),
                    approval.created_at,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn load_pending_approval(&self, request_id: &str) -> Result<Option<PendingApproval>> {
        let conn = self.conn.clone();
        let request_id = request_id.to_string();
        let row = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    "SELECT request_id, consumer, tool_use_id, tool_name, arguments, snapshot, status, created_at
                     FROM approval_requests WHERE request_id = ?1 AND status = 'pending'",
                    rusqlite::params![request_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )
                .optional()?;
            Ok::<_, crate::StorageError>(row)
        })
        .await??;

        let Some((request_id, consumer, tool_use_id, tool_name, arguments, snapshot, status, created_at)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(PendingApproval {
            request_id,
            consumer,
            tool_use_id,
            tool_name,
            arguments: serde_json::from_str(&arguments)?,
            snapshot: serde_json::from_str(&snapshot)?,
            status: ApprovalStatus::parse(&status),
            created_at,
        }))
    }

    async fn resolve_pending_approval(
        &self,
        request_id: &str,
        status: ApprovalStatus,
    ) -> Result<bool> {
        let conn = self.conn.clone();
        let request_id = request_id.to_string();
        let now = now_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE approval_requests SET status = ?1, resolved_at = ?2
                 WHERE request_id = ?3 AND status = 'pending'",
                rusqlite::params![status.as_str(), now, request_id],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    async fn log_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        let conn = self.conn.clone();
        let arguments = serde_json::to_string(&record.arguments)?;
        let result = record.truncated_result();
        let record = record.clone();
        let now = now_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO tool_calls
                    (consumer, tool_name, arguments, result, model, latency_ms, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.consumer,
                    record.tool_name,
                    arguments,
                    result,
                    record.model,
                    record.latency_ms as i64,
                    record.is_error as i32,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn recent_tool_calls(&self, consumer: &str, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let conn = self.conn.clone();
        let consumer = consumer.to_string();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT consumer, tool_name, arguments, result, model, latency_ms, is_error
                 FROM tool_calls WHERE consumer = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![consumer, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i32>(6)? != 0,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok::<_, crate::StorageError>(rows)
        })
        .await??;

        rows.into_iter()
            .map(
                |(consumer, tool_name, arguments, result, model, latency_ms, is_error)| -> Result<ToolCallRecord> {
                    Ok(ToolCallRecord {
                        consumer,
                        tool_name,
                        arguments: match arguments {
                            Some(text) => serde_json::from_str(&text)?,
                            None => serde_json::Value::Null,
                        },
                        result: result.unwrap_or_default(),
                        is_error,
                        latency_ms: latency_ms as u64,
                        model,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::ContentBlock;
    use serde_json::json;

    fn pending(id: &str) -> PendingApproval {
        PendingApproval {
            request_id: id.into(),
            consumer: "inbox".into(),
            tool_use_id: "toolu_1".into(),
            tool_name: "send_email".into(),
            arguments: json!({"to": "a@b.c"}),
            snapshot: vec![ConversationTurn::user("send it")],
            status: ApprovalStatus::Pending,
            created_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_history_order_and_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let turns: Vec<_> = (0..5)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationTurn::user(format!("q{i}"))
                } else {
                    ConversationTurn::assistant(format!("a{i}"))
                }
            })
            .collect();
        store.append_turns("inbox", &turns).await.unwrap();
        store
            .append_turns("other", &[ConversationTurn::user("elsewhere")])
            .await
            .unwrap();

        let history = store.load_history("inbox", 3).await.unwrap();
        let texts: Vec<_> = history.iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["q2", "a3", "q4"]);
    }

    #[tokio::test]
    async fn test_tool_blocks_and_usage_survive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut turn = ConversationTurn::new(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "search_emails".into(),
                input: json!({"query": "invoice"}),
            }],
        );
        turn.usage.input_tokens = 120;
        turn.usage.output_tokens = 30;
        store.append_turns("inbox", &[turn.clone()]).await.unwrap();

        let loaded = store.load_history("inbox", 10).await.unwrap();
        assert_eq!(loaded, vec![turn]);
    }

    #[tokio::test]
    async fn test_summary_latest_wins_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_summary("inbox").await.unwrap().is_none());
        store.save_summary("inbox", "first").await.unwrap();
        store.save_summary("inbox", "second").await.unwrap();
        assert_eq!(store.load_summary("inbox").await.unwrap().as_deref(), Some("second"));

        store.append_turns("inbox", &[ConversationTurn::user("hi")]).await.unwrap();
        store.clear_history("inbox").await.unwrap();
        assert!(store.load_history("inbox", 10).await.unwrap().is_empty());
        assert!(store.load_summary("inbox").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_approval_resolves_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_pending_approval(&pending("req-1")).await.unwrap();

        let loaded = store.load_pending_approval("req-1").await.unwrap().unwrap();
        assert_eq!(loaded, pending("req-1"));

        assert!(
            store
                .resolve_pending_approval("req-1", ApprovalStatus::Approved)
                .await
                .unwrap()
        );
        assert!(
            !store
                .resolve_pending_approval("req-1", ApprovalStatus::Rejected)
                .await
                .unwrap()
        );
        assert!(store.load_pending_approval("req-1").await.unwrap().is_none());
        assert!(
            !store
                .resolve_pending_approval("missing", ApprovalStatus::Approved)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_tool_call_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .log_tool_call(&ToolCallRecord {
                    consumer: "inbox".into(),
                    tool_name: format!("tool_{i}"),
                    arguments: json!({"i": i}),
                    result: "ok".into(),
                    is_error: i == 2,
                    latency_ms: 10 * i as u64,
                    model: "claude-sonnet-4-6".into(),
                })
                .await
                .unwrap();
        }
        let calls = store.recent_tool_calls("inbox", 2).await.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "tool_2");
        assert!(calls[0].is_error);
        assert_eq!(calls[1].arguments, json!({"i": 1}));
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concierge.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.append_turns("inbox", &[ConversationTurn::user("kept")]).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let history = store.load_history("inbox", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "kept");
    }
}
