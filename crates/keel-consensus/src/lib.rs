//! Round-based consensus engine for keel committees.
//!
//! One round runs per solid state index:
//!
//! 1. every member proposes a bounded batch of pending requests
//! 2. the agreement primitive delivers a common set of proposals, merged
//!    into one canonical batch ([`merge_batch`])
//! 3. the batch runs on the deterministic VM ([`VmRunner`])
//! 4. contributors sign the resulting transaction essence and exchange
//!    partial signatures ([`SignatureCollector`])
//! 5. at quorum the signed anchor transaction is posted and polled for
//!    inclusion
//!
//! The next round starts when the state manager announces the confirmed
//! state. Failed rounds are not retried here: the node waits for the next
//! anchor output instead.

pub mod actor;
mod config;
mod engine;
mod error;
mod metrics;
mod pool;
mod ports;
mod round;
mod signatures;

pub use actor::{channel, Actor, Inbox, Mailbox};
pub use config::ConsensusConfig;
pub use engine::{Consensus, ConsensusContext, ConsensusStatus, ExecutionJob, ExecutionOutcome};
pub use error::{ConsensusError, Result};
pub use metrics::ConsensusMetrics;
pub use pool::{RequestPool, RequestPoolConfig};
pub use ports::{
    Agreement, CandidateSink, InclusionState, Mempool, MempoolStats, NodeConnection,
    RequestResult, ResultBroadcast, VmError, VmOutput, VmRunner, VmTask,
};
pub use round::{
    merge_batch, session_id, AgreedBatch, BatchProposal, ExecutedBatch, RoundFlags, RoundPhase,
    RoundState,
};
pub use signatures::{Collected, SignatureCollector};
