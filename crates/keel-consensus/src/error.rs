//! Consensus error types.

use keel_types::{MemberIndex, RequestId};
use thiserror::Error;

/// Errors that can occur during consensus operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Invalid proposal or agreement result.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// Signature from a member outside the committee.
    #[error("signer {index} outside committee of {size}")]
    SignerOutOfRange {
        /// Claimed member index.
        index: MemberIndex,
        /// Committee size.
        size: usize,
    },

    /// Second signature from the same member.
    #[error("duplicate signature from member {0}")]
    DuplicateSignature(MemberIndex),

    /// Signature that does not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The VM runner failed or returned an inconsistent result.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Request already in the pool.
    #[error("duplicate request: {0}")]
    DuplicateRequest(RequestId),

    /// Malformed shared type.
    #[error("types error: {0}")]
    Types(#[from] keel_types::TypesError),

    /// The committee was dismissed.
    #[error("committee dismissed: {0}")]
    Dismissed(String),
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
