//! Collaborators of the state manager.
//!
//! All calls are fire-and-forget: implementations hand the request to another
//! worker or transport and must never block the state manager's event loop.

use keel_state::{Block, VirtualState};
use keel_types::{ChainAddress, MemberIndex, OutputId, RequestId, StateOutput};
use std::sync::Arc;

/// Messaging towards other committee members.
pub trait PeerNetwork: Send + Sync {
    /// Asks `peer` for the block producing `state_index`.
    fn request_block(&self, peer: MemberIndex, state_index: u32);

    /// Sends a block to `peer`.
    fn send_block(&self, peer: MemberIndex, block: &Block);
}

/// Requests towards the ledger node connection. Answers arrive later as
/// anchor outputs delivered to the state manager.
pub trait OutputFetcher: Send + Sync {
    /// Asks for the chain's current anchor output.
    fn pull_state(&self, chain: &ChainAddress);

    /// Asks for a specific, already confirmed anchor output.
    fn pull_confirmed_output(&self, chain: &ChainAddress, output_id: &OutputId);
}

/// A validated solid state matching the ledger's latest anchor output.
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// The new solid state.
    pub solid_state: Arc<VirtualState>,
    /// The anchor output committing it.
    pub output: StateOutput,
    /// Requests processed by the blocks applied since the last transition.
    pub processed: Vec<RequestId>,
}

/// Receiver of state transitions (the consensus engine).
pub trait TransitionSink: Send + Sync {
    /// Delivers a transition.
    fn on_state_transition(&self, transition: StateTransition);
}
