//! P2P error types.

use thiserror::Error;

/// Errors that can occur when handling peer messages.
#[derive(Debug, Error)]
pub enum P2PError {
    /// The message could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// An embedded block was malformed.
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] keel_state::StateError),
}

/// A specialized Result type for P2P operations.
pub type Result<T> = std::result::Result<T, P2PError>;
