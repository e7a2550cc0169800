//! Reference-counted pool of capability-server instances.
//!
//! Each [`InstanceKey`] owns a slot whose mutex serializes every lifecycle
//! transition for that key. Starting a process holds the slot lock, so a
//! concurrent `acquire` for the same key waits for the in-flight start
//! instead of launching a second process. Unrelated keys never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use concierge_types::{InstanceKey, LaunchSpec};

use crate::error::McpError;
use crate::process::{AdapterOptions, ProcessAdapter, ToolServer};
use crate::protocol::RemoteTool;

/// Starts a server for a launch spec. The seam between lifecycle and process plumbing.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, key: &InstanceKey, spec: &LaunchSpec) -> Result<Arc<dyn ToolServer>, McpError>;
}

/// Launches real subprocesses through [`ProcessAdapter`].
pub struct StdioLauncher {
    options: AdapterOptions,
}

impl StdioLauncher {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ServerLauncher for StdioLauncher {
    async fn launch(&self, key: &InstanceKey, spec: &LaunchSpec) -> Result<Arc<dyn ToolServer>, McpError> {
        let adapter = ProcessAdapter::start(key.to_string(), spec, self.options).await?;
        Ok(Arc::new(adapter))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Absent,
    Starting,
    Ready,
    Draining,
}

/// Point-in-time view of one instance, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub key: InstanceKey,
    pub phase: InstancePhase,
    pub refcount: usize,
    pub generation: u64,
}

struct SlotState {
    phase: InstancePhase,
    server: Option<Arc<dyn ToolServer>>,
    refcount: usize,
    /// Bumped whenever a process is started or written off; leases from an
    /// older generation are inert.
    generation: u64,
    /// Bumped on every acquire and on every scheduled drain, so a delayed
    /// drain can tell whether it is still wanted.
    drain_epoch: u64,
}

struct Slot {
    key: InstanceKey,
    cooldown: Duration,
    state: Mutex<SlotState>,
}

pub struct InstanceManager {
    launcher: Arc<dyn ServerLauncher>,
    cooldown: Duration,
    slots: RwLock<HashMap<InstanceKey, Arc<Slot>>>,
}

impl InstanceManager {
    pub fn new(launcher: Arc<dyn ServerLauncher>, cooldown: Duration) -> Self {
        Self {
            launcher,
            cooldown,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &InstanceKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(Slot {
                key: key.clone(),
                cooldown: self.cooldown,
                state: Mutex::new(SlotState {
                    phase: InstancePhase::Absent,
                    server: None,
                    refcount: 0,
                    generation: 0,
                    drain_epoch: 0,
                }),
            })
        }))
    }

    /// Take a lease on the instance for `key`, starting it if necessary.
    pub async fn acquire(&self, key: &InstanceKey, spec: &LaunchSpec) -> Result<Lease, McpError> {
        let slot = self.slot(key).await;
        let mut state = slot.state.lock().await;

        if state.phase == InstancePhase::Ready {
            let server = state.server.clone();
            match server {
                Some(server) if server.is_alive() => {
                    state.refcount += 1;
                    state.drain_epoch += 1;
                    debug!(key = %key, refcount = state.refcount, "Reusing instance");
                    return Ok(Lease::new(Arc::clone(&slot), server, state.generation));
                }
                _ => {
                    warn!(key = %key, "Instance died while idle, restarting");
                    slot.write_off(&mut state).await;
                }
            }
        }

        state.phase = InstancePhase::Starting;
        info!(key = %key, command = %spec.command_line(), "Starting instance");
        match self.launcher.launch(key, spec).await {
            Ok(server) => {
                state.phase = InstancePhase::Ready;
                state.server = Some(Arc::clone(&server));
                state.refcount = 1;
                state.generation += 1;
                state.drain_epoch += 1;
                Ok(Lease::new(Arc::clone(&slot), server, state.generation))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Instance failed to start");
                state.phase = InstancePhase::Absent;
                Err(e)
            }
        }
    }

    /// Snapshot of all ready instances.
    ///
    /// Waits out any start or stop in flight, so the result reflects where
    /// each transition settled.
    pub async fn list_instances(&self) -> Vec<InstanceStatus> {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let state = slot.state.lock().await;
            if state.phase == InstancePhase::Ready {
                out.push(InstanceStatus {
                    key: slot.key.clone(),
                    phase: state.phase,
                    refcount: state.refcount,
                    generation: state.generation,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Current reference count for `key` (0 when never started).
    pub async fn refcount(&self, key: &InstanceKey) -> usize {
        match self.slots.read().await.get(key).cloned() {
            Some(slot) => slot.state.lock().await.refcount,
            None => 0,
        }
    }

    pub async fn is_running(&self, key: &InstanceKey) -> bool {
        match self.slots.read().await.get(key).cloned() {
            Some(slot) => slot.state.lock().await.phase == InstancePhase::Ready,
            None => false,
        }
    }

    /// Stop every instance regardless of outstanding leases.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            let mut state = slot.state.lock().await;
            if state.server.is_some() {
                info!(key = %slot.key, refcount = state.refcount, "Stopping instance for shutdown");
                slot.write_off(&mut state).await;
            }
        }
    }
}

impl Slot {
    async fn release(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.refcount == 0 {
            debug!(key = %self.key, "Ignoring release of stale lease");
            return;
        }
        state.refcount -= 1;
        debug!(key = %self.key, refcount = state.refcount, "Lease released");
        if state.refcount > 0 {
            return;
        }

        if self.cooldown.is_zero() {
            self.drain(&mut state).await;
            return;
        }

        state.drain_epoch += 1;
        let epoch = state.drain_epoch;
        drop(state);

        let slot = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(slot.cooldown).await;
            let mut state = slot.state.lock().await;
            if state.drain_epoch == epoch
                && state.refcount == 0
                && state.generation == generation
                && state.phase == InstancePhase::Ready
            {
                slot.drain(&mut state).await;
            }
        });
    }

    async fn drain(&self, state: &mut SlotState) {
        state.phase = InstancePhase::Draining;
        if let Some(server) = state.server.take() {
            info!(key = %self.key, "Stopping idle instance");
            server.stop().await;
        }
        state.phase = InstancePhase::Absent;
    }

    /// Forget the current process. Outstanding leases become inert.
    async fn write_off(&self, state: &mut SlotState) {
        self.drain(state).await;
        state.refcount = 0;
        state.generation += 1;
    }

    async fn mark_lost(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        warn!(key = %self.key, refcount = state.refcount, "Instance lost, marking absent");
        self.write_off(&mut state).await;
    }
}

/// A consumer's claim on a running instance.
///
/// Dropping a lease releases it on the runtime in the background; call
/// [`Lease::release`] to release deterministically.
pub struct Lease {
    slot: Arc<Slot>,
    server: Arc<dyn ToolServer>,
    generation: u64,
    released: bool,
}

impl Lease {
    fn new(slot: Arc<Slot>, server: Arc<dyn ToolServer>, generation: u64) -> Self {
        Self {
            slot,
            server,
            generation,
            released: false,
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.slot.key
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let result = self.server.list_tools().await;
        self.observe(result).await
    }

    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, McpError> {
        let result = self.server.invoke(tool, arguments).await;
        self.observe(result).await
    }

    async fn observe<T>(&self, result: Result<T, McpError>) -> Result<T, McpError> {
        if let Err(e) = &result {
            if e.is_process_lost() {
                self.slot.mark_lost(self.generation).await;
            }
        }
        result
    }

    pub async fn release(mut self) {
        self.released = true;
        self.slot.release(self.generation).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let slot = Arc::clone(&self.slot);
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { slot.release(generation).await });
            }
            Err(_) => warn!(key = %self.slot.key, "Lease dropped outside a runtime, not released"),
        }
    }
}
