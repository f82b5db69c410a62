//! Type conversion errors.

use thiserror::Error;

/// Errors that can occur when building or decoding shared types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// A byte slice had the wrong length.
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// What was being decoded.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    /// A hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The committee description is inconsistent.
    #[error("invalid committee: {0}")]
    InvalidCommittee(String),

    /// A transaction failed verification.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}
