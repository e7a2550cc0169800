//! In-process fake servers for exercising lifecycle and dispatch without subprocesses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use concierge_types::{CapabilityType, InstanceKey, LaunchSpec};

use crate::error::McpError;
use crate::manager::ServerLauncher;
use crate::process::ToolServer;
use crate::protocol::RemoteTool;

type Handler = Arc<dyn Fn(&str, &Value) -> Result<String, McpError> + Send + Sync>;

/// A scripted [`ToolServer`]. Tools answer `"<name> ok"` unless a handler is set.
pub struct FakeServer {
    label: String,
    tools: Vec<RemoteTool>,
    handler: Option<Handler>,
    alive: AtomicBool,
    stopped: AtomicBool,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        let tools = names
            .iter()
            .map(|name| RemoteTool {
                name: name.to_string(),
                description: Some(format!("{name} tool")),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect();
        Self {
            label: "fake".into(),
            tools,
            handler: None,
            alive: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<String, McpError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// A new server with the same tools and handler, in its initial state.
    pub fn fresh(&self, label: &str) -> Self {
        Self {
            label: label.to_string(),
            tools: self.tools.clone(),
            handler: self.handler.clone(),
            alive: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the process dying: every later call fails with `ProcessLost`.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn lost(&self) -> McpError {
        McpError::ProcessLost {
            server: self.label.clone(),
        }
    }
}

#[async_trait]
impl ToolServer for FakeServer {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        if !self.is_alive() {
            return Err(self.lost());
        }
        Ok(self.tools.clone())
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, McpError> {
        if !self.is_alive() {
            return Err(self.lost());
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tool.to_string(), arguments.clone()));
        }
        match &self.handler {
            Some(handler) => handler(tool, &arguments),
            None => Ok(format!("{tool} ok")),
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// A [`ServerLauncher`] that hands out [`FakeServer`]s and counts launches.
pub struct FakeLauncher {
    default: Option<FakeServer>,
    per_capability: HashMap<CapabilityType, FakeServer>,
    delay: Duration,
    launches: AtomicUsize,
    launched: Mutex<Vec<Arc<FakeServer>>>,
}

impl FakeLauncher {
    pub fn new(template: FakeServer) -> Self {
        Self {
            default: Some(template),
            per_capability: HashMap::new(),
            delay: Duration::ZERO,
            launches: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Every launch fails with a startup error.
    pub fn failing() -> Self {
        Self {
            default: None,
            ..Self::new(FakeServer::with_tools(&[]))
        }
    }

    pub fn with_capability(mut self, capability: CapabilityType, template: FakeServer) -> Self {
        self.per_capability.insert(capability, template);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Launch attempts, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.servers().iter().filter(|s| s.is_stopped()).count()
    }

    pub fn servers(&self) -> Vec<Arc<FakeServer>> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn last_server(&self) -> Option<Arc<FakeServer>> {
        self.servers().pop()
    }

    /// Every tool call that reached any launched server.
    pub fn all_calls(&self) -> Vec<(String, Value)> {
        self.servers().iter().flat_map(|s| s.calls()).collect()
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, key: &InstanceKey, _spec: &LaunchSpec) -> Result<Arc<dyn ToolServer>, McpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let template = self
            .per_capability
            .get(&key.capability)
            .or(self.default.as_ref())
            .ok_or_else(|| McpError::Startup {
                server: key.to_string(),
                reason: "fake launcher configured to fail".into(),
            })?;
        let server = Arc::new(template.fresh(&key.to_string()));
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(Arc::clone(&server));
        }
        Ok(server)
    }
}
