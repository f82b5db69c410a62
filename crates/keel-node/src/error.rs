//! Error types for the node.

use thiserror::Error;

/// Errors raised while configuring or starting a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but is not usable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The chain instance could not bootstrap its state.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] keel_statemgr::StateManagerError),

    /// Storage error outside bootstrap.
    #[error("storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),

    /// Committee or identifier error.
    #[error("types error: {0}")]
    Types(#[from] keel_types::TypesError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
