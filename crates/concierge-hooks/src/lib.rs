//! concierge-hooks: lifecycle event bus.
//!
//! Subscribers observe tool calls, approvals and finished runs.
//! The approval notifier listens for [`events::HookEvent::ApprovalRequested`]
//! and answers through the runtime.

pub mod events;
pub mod registry;

pub use events::HookEvent;
pub use registry::{HookHandler, HookRegistry};
