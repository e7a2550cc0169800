use concierge_config::ConfigError;
use concierge_mcp::McpError;
use concierge_storage::StorageError;

use crate::model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),
    #[error("Configuration error: {0}")]
    Config(ConfigError),
    #[error("Tool catalog error: {0}")]
    Catalog(#[from] McpError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Run cancelled")]
    Cancelled,
    #[error("No pending approval with id {0}")]
    ApprovalNotFound(String),
}

impl AgentError {
    /// Failures the operator has to act on, as opposed to ones the model
    /// already saw as tool results.
    pub fn is_operational(&self) -> bool {
        match self {
            AgentError::Catalog(e) => e.is_operational(),
            AgentError::Cancelled => false,
            _ => true,
        }
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::UnknownConsumer(id) => AgentError::UnknownConsumer(id),
            other => AgentError::Config(other),
        }
    }
}
