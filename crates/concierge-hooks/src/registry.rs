//! Hook registry: subscriptions and dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::HookEvent;

/// Async hook handler.
pub type HookHandler =
    Arc<dyn Fn(HookEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub const WILDCARD: &str = "*";

pub struct HookRegistry {
    /// Event name to handlers; `"*"` receives everything.
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for one event name.
    pub async fn on(&self, event_name: &str, handler: HookHandler) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    pub async fn on_many(&self, event_names: &[&str], handler: HookHandler) {
        for event_name in event_names {
            self.on(event_name, handler.clone()).await;
        }
    }

    /// Dispatch to matching and wildcard handlers. Handlers run on their own
    /// tasks so a slow subscriber never stalls the caller.
    pub async fn emit(&self, event: HookEvent) {
        let handlers = self.handlers.read().await;
        let matching = handlers
            .get(event.name())
            .into_iter()
            .chain(handlers.get(WILDCARD))
            .flatten();

        let mut dispatched = 0usize;
        for handler in matching {
            let event = event.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
            dispatched += 1;
        }
        tracing::trace!(event = event.name(), handlers = dispatched, "hook emitted");
    }

    pub async fn has_subscribers(&self, event_name: &str) -> bool {
        let handlers = self.handlers.read().await;
        [event_name, WILDCARD]
            .iter()
            .any(|name| handlers.get(*name).is_some_and(|list| !list.is_empty()))
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(counter: &Arc<AtomicU32>) -> HookHandler {
        let c = counter.clone();
        Arc::new(move |_event| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn finished() -> HookEvent {
        HookEvent::RunFinished {
            consumer: "default".into(),
            reason: "done".into(),
            iterations: 1,
            tokens: 10,
        }
    }

    #[tokio::test]
    async fn test_emit_event() {
        let registry = HookRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        registry.on("run_finished", counting(&counter)).await;

        registry.emit(finished()).await;
        registry
            .emit(HookEvent::ApprovalResolved {
                request_id: "x".into(),
                approved: false,
            })
            .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_handler() {
        let registry = HookRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        registry.on(WILDCARD, counting(&counter)).await;

        registry.emit(finished()).await;
        registry
            .emit(HookEvent::ApprovalResolved {
                request_id: "x".into(),
                approved: true,
            })
            .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_many_and_subscribers() {
        let registry = HookRegistry::new();
        assert!(!registry.has_subscribers("approval_requested").await);
        let counter = Arc::new(AtomicU32::new(0));
        registry
            .on_many(&["approval_requested", "approval_resolved"], counting(&counter))
            .await;
        assert!(registry.has_subscribers("approval_requested").await);

        registry
            .emit(HookEvent::ApprovalResolved {
                request_id: "x".into(),
                approved: true,
            })
            .await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
