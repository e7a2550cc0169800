//! Operator confirmation for gated tool calls.
//!
//! A run registers a request, announces it, and parks on [`ApprovalBroker::wait`]
//! until [`ApprovalBroker::resolve`] delivers a decision, the optional expiry
//! passes, or the run is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    /// No decision before the expiry; treated as a rejection.
    Expired,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>;

fn lock(waiters: &Waiters) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A registered request. Pass it back to [`ApprovalBroker::wait`].
///
/// Dropping the ticket unregisters the request, so a run that is cancelled
/// or dropped mid-wait never leaves a stale entry behind.
pub struct ApprovalTicket {
    pub request_id: String,
    rx: oneshot::Receiver<bool>,
    waiters: Waiters,
}

impl Drop for ApprovalTicket {
    fn drop(&mut self) {
        lock(&self.waiters).remove(&self.request_id);
    }
}

pub struct ApprovalBroker {
    waiters: Waiters,
    expiry: Option<Duration>,
}

impl ApprovalBroker {
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            expiry,
        }
    }

    pub async fn register(&self) -> ApprovalTicket {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(request_id.clone(), tx);
        ApprovalTicket {
            request_id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Park until a decision arrives. `None` means the run was cancelled.
    pub async fn wait(
        &self,
        mut ticket: ApprovalTicket,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let rx = &mut ticket.rx;
        let decision = async {
            match self.expiry {
                Some(expiry) => match tokio::time::timeout(expiry, rx).await {
                    Ok(Ok(true)) => ApprovalDecision::Approved,
                    Ok(_) => ApprovalDecision::Rejected,
                    Err(_) => ApprovalDecision::Expired,
                },
                None => match rx.await {
                    Ok(true) => ApprovalDecision::Approved,
                    _ => ApprovalDecision::Rejected,
                },
            }
        };

        tokio::select! {
            d = decision => Some(d),
            _ = cancel.cancelled() => None,
        }
    }

    /// Hand a decision to the run waiting on `request_id`.
    /// Returns `false` when no live run is waiting.
    pub async fn resolve(&self, request_id: &str, approved: bool) -> bool {
        let waiter = lock(&self.waiters).remove(request_id);
        match waiter {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.waiters).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new(None)
    }
}
