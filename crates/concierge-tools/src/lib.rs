//! concierge-tools: what each capability type offers and what a consumer may call.
//!
//! Provides:
//! - Capability metadata (read/write tool prefixes, approval-gated tools)
//! - Phase-based tool policy resolution (read_only/drafts/controlled)
//! - Tool schema minimization for model requests

pub mod capabilities;
pub mod policy;
pub mod schema;
