//! concierge-mcp: capability servers spoken to over stdio JSON-RPC.
//!
//! Layers, bottom up:
//! - [`codec`]/[`protocol`]: framing and message shapes
//! - [`process`]: one subprocess per [`process::ProcessAdapter`]
//! - [`manager`]: reference-counted instances keyed by capability and account
//! - [`registry`]: per-consumer catalogs with unique public tool names
//! - [`factory`]: launch specs for each capability type

pub mod codec;
pub mod error;
pub mod factory;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::McpError;
pub use manager::{InstanceManager, InstanceStatus, Lease, ServerLauncher, StdioLauncher};
pub use process::{AdapterOptions, ProcessAdapter, ToolServer};
pub use registry::{CatalogView, ToolDescriptor, ToolRegistry};
