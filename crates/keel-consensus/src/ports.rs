//! Collaborators of the consensus engine.
//!
//! Calls that reach another worker or the network are fire-and-forget:
//! answers come back later as mailbox messages. Only the mempool and the VM
//! runner return values directly, and the VM runner is always invoked off the
//! event loop.

use crate::round::BatchProposal;
use keel_p2p::SignedResult;
use keel_state::{Block, VirtualState};
use keel_types::{
    ChainAddress, HashValue, OutputId, Request, RequestId, SignedTransaction, TransactionEssence,
    TransactionId,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Snapshot of mempool contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MempoolStats {
    /// Number of pending requests.
    pub request_count: usize,
    /// Age of the oldest pending request.
    pub oldest_request_age: Duration,
    /// Average number of times pending requests were proposed.
    pub average_propose_count: f64,
}

/// Source of pending requests.
pub trait Mempool: Send + Sync {
    /// Current contents.
    fn stats(&self) -> MempoolStats;

    /// Up to `max` ready requests, ordered by request id.
    fn ready_requests(&self, max: usize) -> Vec<Request>;

    /// Looks up requests by id. Returns the requests found, in the order
    /// asked, and the ids that are missing.
    fn get_requests(&self, ids: &[RequestId]) -> (Vec<Request>, Vec<RequestId>);

    /// Drops requests processed by a confirmed block.
    fn remove_requests(&self, ids: &[RequestId]);

    /// Drops requests that waited longer than the pool allows. Returns how
    /// many were dropped.
    fn reap_expired(&self) -> usize;
}

/// Everything the VM needs to execute one batch.
#[derive(Debug, Clone)]
pub struct VmTask {
    /// Chain being executed.
    pub chain: ChainAddress,
    /// Solid state the batch runs on.
    pub state: Arc<VirtualState>,
    /// Anchor output consumed by the resulting transaction.
    pub consumed_output: OutputId,
    /// Agreed requests, in batch order.
    pub requests: Vec<Request>,
    /// Agreed committee entropy.
    pub entropy: HashValue,
    /// Agreed timestamp.
    pub timestamp_ms: u64,
}

impl VmTask {
    /// The essence committing `next_state`, as every honest VM must produce it.
    pub fn essence_for(&self, block: &Block, next_state: &VirtualState) -> TransactionEssence {
        TransactionEssence {
            chain: self.chain,
            consumed_output: self.consumed_output,
            state_index: next_state.index(),
            state_hash: next_state.hash(),
            requests: block.request_ids().collect(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Outcome of one request inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    /// The request.
    pub request_id: RequestId,
    /// Error reported by the contract, if any.
    pub error: Option<String>,
}

/// Result of executing a batch.
#[derive(Debug, Clone)]
pub struct VmOutput {
    /// Block with one update per request.
    pub block: Block,
    /// State after applying the block.
    pub next_state: VirtualState,
    /// Essence of the anchor transaction.
    pub essence: TransactionEssence,
    /// Per-request results.
    pub results: Vec<RequestResult>,
}

/// Error reported by the VM runner.
#[derive(Debug, Clone, Error)]
#[error("vm error: {0}")]
pub struct VmError(pub String);

/// Deterministic batch executor.
///
/// Two honest runners given the same task must produce byte-identical outputs.
pub trait VmRunner: Send + Sync {
    /// Executes `task`.
    fn run(&self, task: VmTask) -> std::result::Result<VmOutput, VmError>;
}

/// Ledger inclusion state of a posted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionState {
    /// Included in the ledger.
    Confirmed,
    /// Rejected (e.g. the consumed output is already spent).
    Rejected,
    /// Not seen yet.
    Unknown,
}

/// Connection to the ledger node.
pub trait NodeConnection: Send + Sync {
    /// Posts a finalized transaction.
    fn post_transaction(&self, transaction: &SignedTransaction);

    /// Asks for the inclusion state of `tx_id`. The answer arrives as an
    /// inclusion state message.
    fn pull_inclusion_state(&self, tx_id: &TransactionId);
}

/// The committee agreement primitive (asynchronous common subset).
///
/// Every honest member eventually receives the same ordered set of at least
/// a quorum of proposals for `session_id`.
pub trait Agreement: Send + Sync {
    /// Submits this node's input for `session_id`.
    fn propose(&self, session_id: u64, proposal: BatchProposal);
}

/// Delivery of partial signatures to the rest of the committee.
pub trait ResultBroadcast: Send + Sync {
    /// Sends `result` to every other member.
    fn broadcast_signed_result(&self, result: &SignedResult);
}

/// Receiver of locally computed candidate blocks (the state manager).
pub trait CandidateSink: Send + Sync {
    /// Registers a candidate and the state it produces.
    fn register_candidate(&self, block: Block, next_state: Arc<VirtualState>);
}

impl CandidateSink for keel_statemgr::Mailbox {
    fn register_candidate(&self, block: Block, next_state: Arc<VirtualState>) {
        keel_statemgr::Mailbox::register_candidate(self, block, next_state);
    }
}
