//! concierge-agent: the tool-use loop and everything around one request.
//!
//! - [`model`]/[`anthropic`]: the hosted model boundary
//! - [`context`]/[`summarizer`]: the outgoing conversation window
//! - [`approval`]: operator confirmation for gated tools
//! - [`runner`]: the bounded tool-use loop
//! - [`runtime`]: consumer resolution, catalog lifetime, persistence

pub mod anthropic;
pub mod approval;
pub mod context;
pub mod error;
pub mod model;
pub mod runner;
pub mod runtime;
pub mod summarizer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use anthropic::AnthropicClient;
pub use approval::{ApprovalBroker, ApprovalDecision};
pub use error::AgentError;
pub use model::{ModelClient, ModelError, ModelRequest, ModelResponse, StopReason};
pub use runner::{AgentLoop, LoopConfig, LoopOutcome, LoopState, Termination};
pub use runtime::{AgentReply, AgentRuntime};
