//! One capability-server subprocess and its stdio channel.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use concierge_config::ServersConfig;
use concierge_types::{Framing, LaunchSpec};

use crate::codec::{FrameReader, write_frame};
use crate::error::McpError;
use crate::protocol::{self, CallOutcome, Inbound, RemoteTool, Reply};

/// Request/response surface of a running capability server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError>;

    /// Invoke a tool by its original (unprefixed) name. Returns the result text.
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, McpError>;

    /// Shut the server down. Calling it again is a no-op.
    async fn stop(&self);

    fn is_alive(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self::from(&ServersConfig::default())
    }
}

impl From<&ServersConfig> for AdapterOptions {
    fn from(config: &ServersConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

/// Owns exactly one server process.
///
/// Requests are serialized: at most one call is in flight at a time. A
/// background task reads the server's stdout and routes responses to the
/// waiting caller; when stdout closes every waiter fails with
/// [`McpError::ProcessLost`] and the adapter reports itself dead.
pub struct ProcessAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    framing: Framing,
    options: AdapterOptions,
    writer: Mutex<Option<BufWriter<ChildStdin>>>,
    child: Mutex<Option<Child>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    stopped: AtomicBool,
    call_lock: Mutex<()>,
    tools: Mutex<Option<Vec<RemoteTool>>>,
}

impl ProcessAdapter {
    /// Spawn the server and complete the protocol handshake.
    ///
    /// The child is killed if the handshake fails or times out.
    pub async fn start(
        label: impl Into<String>,
        spec: &LaunchSpec,
        options: AdapterOptions,
    ) -> Result<Self, McpError> {
        let label = label.into();
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| McpError::Startup {
            server: label.clone(),
            reason: format!("spawn {}: {e}", spec.command),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(McpError::Startup {
                server: label,
                reason: "stdio pipes unavailable".into(),
            });
        };
        let stderr = child.stderr.take();

        info!(server = %label, command = %spec.command_line(), "Spawned capability server");

        let inner = Arc::new(Inner {
            label,
            framing: spec.framing,
            options,
            writer: Mutex::new(Some(BufWriter::new(stdin))),
            child: Mutex::new(Some(child)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            call_lock: Mutex::new(()),
            tools: Mutex::new(None),
        });

        tokio::spawn(Arc::clone(&inner).reader_loop(stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(inner.label.clone(), stderr));
        }

        let handshake = tokio::time::timeout(options.handshake_timeout, inner.handshake()).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(McpError::ProcessLost { .. })) => Some("process exited before handshake".into()),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "handshake timed out after {:?}",
                options.handshake_timeout
            )),
        };

        if let Some(reason) = failure {
            inner.kill().await;
            return Err(McpError::Startup {
                server: inner.label.clone(),
                reason,
            });
        }

        info!(server = %inner.label, "Capability server ready");
        Ok(Self { inner })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

#[async_trait]
impl ToolServer for ProcessAdapter {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let _guard = self.inner.call_lock.lock().await;
        if let Some(tools) = self.inner.tools.lock().await.clone() {
            return Ok(tools);
        }
        let tools = self.inner.fetch_tools().await?;
        *self.inner.tools.lock().await = Some(tools.clone());
        Ok(tools)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, McpError> {
        let _guard = self.inner.call_lock.lock().await;
        debug!(server = %self.inner.label, tool, "Calling tool");
        let reply = self
            .inner
            .request(
                "tools/call",
                protocol::call_params(tool, arguments),
                self.inner.options.call_timeout,
            )
            .await?;

        match reply {
            Reply::Error(payload) => Err(McpError::ToolExecution {
                tool: tool.to_string(),
                payload,
            }),
            Reply::Result(result) => {
                let outcome = CallOutcome::from_result(&result);
                if outcome.is_error {
                    Err(McpError::ToolExecution {
                        tool: tool.to_string(),
                        payload: Value::String(outcome.text),
                    })
                } else {
                    Ok(outcome.text)
                }
            }
        }
    }

    async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing stdin is the graceful shutdown signal for stdio servers.
        self.inner.writer.lock().await.take();

        let Some(mut child) = self.inner.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.inner.options.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(server = %self.inner.label, %status, "Capability server exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.inner.label, error = %e, "Failed waiting for capability server");
            }
            Err(_) => {
                warn!(server = %self.inner.label, "Capability server ignored shutdown, killing");
                if let Err(e) = child.kill().await {
                    debug!(server = %self.inner.label, error = %e, "Kill failed (already exited?)");
                }
            }
        }
        self.inner.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn handshake(&self) -> Result<(), McpError> {
        let timeout = self.options.handshake_timeout;
        match self
            .request("initialize", protocol::initialize_params(), timeout)
            .await?
        {
            Reply::Result(result) => {
                let server_name = result
                    .pointer("/serverInfo/name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                debug!(server = %self.label, remote = server_name, "Initialize accepted");
            }
            Reply::Error(error) => {
                return Err(McpError::Protocol {
                    server: self.label.clone(),
                    reason: format!("initialize rejected: {error}"),
                });
            }
        }
        self.send(&protocol::notification("notifications/initialized", Value::Object(Default::default())))
            .await
    }

    async fn fetch_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let reply = self
            .request(
                "tools/list",
                Value::Object(Default::default()),
                self.options.call_timeout,
            )
            .await?;
        let result = match reply {
            Reply::Result(result) => result,
            Reply::Error(error) => {
                return Err(McpError::Protocol {
                    server: self.label.clone(),
                    reason: format!("tools/list failed: {error}"),
                });
            }
        };
        protocol::parse_tool_list(&result).map_err(|reason| McpError::Protocol {
            server: self.label.clone(),
            reason,
        })
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Reply, McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.lost());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if !self.alive.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(self.lost());
        }

        if let Err(e) = self.send(&protocol::request(id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.lost()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    server: self.label.clone(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn send(&self, message: &Value) -> Result<(), McpError> {
        let payload = serde_json::to_vec(message).map_err(|e| McpError::Protocol {
            server: self.label.clone(),
            reason: format!("encode: {e}"),
        })?;
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| self.lost())?;
        if let Err(e) = write_frame(stream, self.framing, &payload).await {
            debug!(server = %self.label, error = %e, "Write to capability server failed");
            return Err(self.lost());
        }
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut frames = FrameReader::new(stdout, self.framing);
        loop {
            let frame = match frames.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %self.label, error = %e, "Unreadable frame from capability server");
                    break;
                }
            };
            if frame.first() == Some(&0x1b) {
                debug!(server = %self.label, "Skipping ANSI log line on stdout");
                continue;
            }
            match serde_json::from_slice::<Value>(&frame) {
                Ok(message) => self.dispatch_inbound(message).await,
                Err(e) => {
                    warn!(
                        server = %self.label,
                        error = %e,
                        line = %String::from_utf8_lossy(&frame),
                        "Ignoring non-JSON output from capability server"
                    );
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.pending.lock().await);
        if !self.stopped.load(Ordering::SeqCst) {
            warn!(server = %self.label, pending = waiters.len(), "Capability server closed its output");
        }
        // Dropping the senders wakes every waiter with ProcessLost.
        drop(waiters);
    }

    async fn dispatch_inbound(&self, message: Value) {
        match protocol::classify(message) {
            Inbound::Response { id, reply } => {
                let waiter = self.pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(server = %self.label, id, "Response for unknown request"),
                }
            }
            Inbound::Request { id, method } => {
                let answer = if method == "ping" {
                    protocol::response(id, Value::Object(Default::default()))
                } else {
                    warn!(server = %self.label, method = %method, "Unsupported server request");
                    protocol::error_response(
                        id,
                        protocol::METHOD_NOT_FOUND,
                        &format!("client does not implement method '{method}'"),
                    )
                };
                if let Err(e) = self.send(&answer).await {
                    debug!(server = %self.label, error = %e, "Failed to answer server request");
                }
            }
            Inbound::Notification { method } => {
                debug!(server = %self.label, method = %method, "Server notification");
                if method == "notifications/tools/list_changed" {
                    // Re-fetched lazily on the next list_tools call.
                    self.tools.lock().await.take();
                }
            }
            Inbound::Unknown => {
                debug!(server = %self.label, "Ignoring unclassifiable message");
            }
        }
    }

    async fn kill(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.writer.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    fn lost(&self) -> McpError {
        McpError::ProcessLost {
            server: self.label.clone(),
        }
    }
}

async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %label, "{line}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use concierge_types::CapabilityType;
    use serde_json::json;

    fn sh(script: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new(CapabilityType::Slack, "/bin/sh").with_args(["-c", script]);
        if let Ok(path) = std::env::var("PATH") {
            spec.env.insert("PATH".into(), path);
        }
        spec
    }

    fn fast() -> AdapterOptions {
        AdapterOptions {
            handshake_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    // Answers initialize, then one tools/list, then one tools/call per line read.
    // Ids are issued sequentially starting at 1.
    const SCRIPTED_SERVER: &str = r#"
read line; echo '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fake"}}}'
read line
read line; echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
read line; echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
read line; echo '{"jsonrpc":"2.0","id":4,"result":{"content":[{"type":"text","text":"bad chat"}],"isError":true}}'
read line; echo '{"jsonrpc":"2.0","id":5,"error":{"code":-32602,"message":"invalid params"}}'
read line
"#;

    #[tokio::test]
    async fn test_start_list_and_invoke() {
        let adapter = ProcessAdapter::start("slack:test", &sh(SCRIPTED_SERVER), fast())
            .await
            .unwrap();
        assert!(adapter.is_alive());

        let tools = adapter.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "echo");

        assert_eq!(adapter.invoke("echo", json!({})).await.unwrap(), "pong");

        let err = adapter.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolExecution { .. }));
        assert!(err.to_string().contains("bad chat"));

        let err = adapter.invoke("echo", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("invalid params"));

        adapter.stop().await;
        assert!(!adapter.is_alive());
        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_exit_before_handshake_is_startup_error() {
        let err = ProcessAdapter::start("slack:test", &sh("exit 0"), fast())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Startup { .. }));
        assert!(err.is_operational());
    }

    #[tokio::test]
    async fn test_missing_binary_is_startup_error() {
        let spec = LaunchSpec::new(CapabilityType::Gmail, "/nonexistent/concierge-server");
        let err = ProcessAdapter::start("gmail:test", &spec, fast()).await.err().unwrap();
        assert!(matches!(err, McpError::Startup { .. }));
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let options = AdapterOptions {
            handshake_timeout: Duration::from_millis(200),
            ..fast()
        };
        let err = ProcessAdapter::start("slack:test", &sh("sleep 5"), options)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_crash_mid_call_is_process_lost() {
        let script = r#"
read line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read line
read line; exit 1
"#;
        let adapter = ProcessAdapter::start("slack:test", &sh(script), fast())
            .await
            .unwrap();
        let err = adapter.invoke("anything", json!({})).await.unwrap_err();
        assert!(err.is_process_lost());
        assert!(!adapter.is_alive());

        let err = adapter.invoke("anything", json!({})).await.unwrap_err();
        assert!(err.is_process_lost());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let script = r#"
read line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read line
read line; sleep 5
"#;
        let adapter = ProcessAdapter::start("slack:test", &sh(script), fast())
            .await
            .unwrap();
        let err = adapter.invoke("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_content_length_framing() {
        let script = r#"
head -c 1 >/dev/null
printf 'Content-Length: 36\r\n\r\n{"jsonrpc":"2.0","id":1,"result":{}}'
sleep 1
"#;
        let mut spec = sh(script);
        spec.framing = Framing::ContentLength;
        let adapter = ProcessAdapter::start("slack:test", &spec, fast()).await.unwrap();
        assert!(adapter.is_alive());
        adapter.stop().await;
    }
}
