//! State manager error types.

use keel_types::HashValue;
use thiserror::Error;

/// Errors that can occur while managing chain state.
#[derive(Debug, Error)]
pub enum StateManagerError {
    /// Persisted state could not be read or written.
    #[error("storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),

    /// A block could not be applied.
    #[error("state error: {0}")]
    State(#[from] keel_state::StateError),

    /// An anchor output carried malformed data.
    #[error("invalid output: {0}")]
    InvalidOutput(#[from] keel_types::TypesError),

    /// A replayed block did not produce the state the ledger committed.
    #[error("conflict at state index {index}: expected {expected}, computed {computed}")]
    Conflict {
        /// State index of the conflicting block.
        index: u32,
        /// Hash committed by the ledger.
        expected: HashValue,
        /// Hash produced locally.
        computed: HashValue,
    },

    /// The committee was dismissed.
    #[error("committee dismissed: {0}")]
    Dismissed(String),
}

/// A specialized Result type for state manager operations.
pub type Result<T> = std::result::Result<T, StateManagerError>;
