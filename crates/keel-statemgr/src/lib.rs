//! State manager for keel chains.
//!
//! The state manager owns the one authoritative *solid state* of a chain and
//! reconciles it with the anchor outputs the ledger confirms:
//!
//! - [`CandidateTracker`] holds unconfirmed blocks, computed locally by the
//!   consensus engine or relayed by peers.
//! - An anchor output approves at most one candidate per index; approved
//!   candidates are applied strictly in index order.
//! - When the ledger or a peer shows the chain is ahead, missing blocks are
//!   requested from peers in a deterministic pseudo-random order
//!   ([`SyncTracker`]).
//! - Every validated solid state matching the latest anchor output is
//!   announced to the consensus engine as a [`StateTransition`].

pub mod actor;
mod candidate;
mod config;
mod error;
mod manager;
mod metrics;
mod ports;
mod sync;

pub use actor::{Actor, Mailbox};
pub use candidate::{Approval, CandidateBlock, CandidateTracker, Registration};
pub use config::StateManagerConfig;
pub use error::{Result, StateManagerError};
pub use manager::{StateManager, StateManagerContext, StateManagerStatus};
pub use metrics::StateManagerMetrics;
pub use ports::{OutputFetcher, PeerNetwork, StateTransition, TransitionSink};
pub use sync::{peer_permutation, PendingRequest, SyncTracker};
