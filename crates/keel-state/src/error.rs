//! State error types.

use keel_types::RequestId;
use thiserror::Error;

/// Errors that can occur when building, decoding or applying blocks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// Bytes could not be decoded.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What was being decoded.
        what: &'static str,
        /// Why decoding failed.
        reason: String,
    },

    /// Encoding version is not supported.
    #[error("unsupported encoding version: {0}")]
    UnsupportedVersion(u8),

    /// A block must carry at least one update.
    #[error("block has no updates")]
    EmptyBlock,

    /// Index 0 belongs to the origin state.
    #[error("block index 0 is reserved for the origin state")]
    ReservedIndex,

    /// The same request appears twice in one block.
    #[error("duplicate request in block: {0}")]
    DuplicateRequest(RequestId),

    /// A block does not extend the state it is applied to.
    #[error("index mismatch: expected {expected}, got {got}")]
    IndexMismatch {
        /// Index the state expects next.
        expected: u32,
        /// Index carried by the block.
        got: u32,
    },
}

/// A specialized Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
