//! Common types used throughout `keel`.
//!
//! This crate provides the leaf types shared by the state manager, the
//! consensus engine and the node wiring:
//!
//! - [`HashValue`]: SHA-256 digests used for state hashes and identifiers
//! - [`ChainAddress`], [`TransactionId`], [`OutputId`], [`RequestId`]
//! - [`StateOutput`]: the ledger's anchor commitment for a chain
//! - [`Request`]: a pending request waiting in the mempool
//! - [`TransactionEssence`] / [`SignedTransaction`]: the anchor transaction
//! - [`Committee`]: the fixed validator set of one chain instance

mod committee;
mod error;
mod hash;
mod ids;
mod output;
mod request;
mod transaction;

pub use committee::{default_quorum, Committee, StaticCommittee};
pub use error::TypesError;
pub use hash::HashValue;
pub use ids::{ChainAddress, OutputId, RequestId, TransactionId};
pub use output::StateOutput;
pub use request::Request;
pub use transaction::{SignedTransaction, TransactionEssence};

/// Re-exported signature primitives so downstream crates agree on one scheme.
pub use ed25519_consensus::{Signature, SigningKey, VerificationKey};

/// A specialized Result type for type-level conversions.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Index of a committee member, also used as its contribution index.
pub type MemberIndex = u16;
