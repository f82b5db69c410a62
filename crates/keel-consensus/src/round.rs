//! Per-round state and batch agreement.

use crate::error::{ConsensusError, Result};
use crate::signatures::SignatureCollector;
use keel_p2p::SignedResult;
use keel_state::{Block, VirtualState};
use keel_types::{HashValue, MemberIndex, SignedTransaction, StateOutput, TransactionEssence};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;

/// One member's input to the agreement primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProposal {
    /// Proposing member.
    pub contributor: MemberIndex,
    /// Solid state index the batch runs on.
    pub state_index: u32,
    /// Proposed requests.
    pub requests: Vec<keel_types::RequestId>,
    /// The member's entropy share.
    pub entropy_share: HashValue,
    /// The member's clock when proposing.
    pub timestamp_ms: u64,
}

/// The canonical batch every honest member derives from the agreed proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreedBatch {
    /// Sorted union of all proposed requests.
    pub requests: Vec<keel_types::RequestId>,
    /// Members whose proposals were agreed, ascending.
    pub contributors: Vec<MemberIndex>,
    /// Hash of the entropy shares in contributor order.
    pub entropy: HashValue,
    /// Median of the proposal timestamps.
    pub timestamp_ms: u64,
}

impl AgreedBatch {
    /// Whether `member` contributed to the batch.
    pub fn has_contributor(&self, member: MemberIndex) -> bool {
        self.contributors.binary_search(&member).is_ok()
    }
}

/// Merges agreed proposals into one batch.
///
/// The result does not depend on the order of `proposals`. Proposals for
/// another state index, from members outside the committee, or repeating a
/// contributor are skipped.
pub fn merge_batch(
    proposals: &[BatchProposal],
    committee_size: usize,
    state_index: u32,
) -> Result<AgreedBatch> {
    let mut valid: Vec<&BatchProposal> = proposals
        .iter()
        .filter(|p| p.state_index == state_index && (p.contributor as usize) < committee_size)
        .collect();
    // Ties between proposals of one contributor resolve to the smallest.
    valid.sort_by(|a, b| {
        a.contributor
            .cmp(&b.contributor)
            .then_with(|| a.entropy_share.cmp(&b.entropy_share))
            .then_with(|| a.timestamp_ms.cmp(&b.timestamp_ms))
            .then_with(|| a.requests.cmp(&b.requests))
    });
    valid.dedup_by_key(|p| p.contributor);

    if valid.is_empty() {
        return Err(ConsensusError::InvalidProposal(format!(
            "no valid proposals for state index {state_index}"
        )));
    }

    let requests: BTreeSet<_> = valid.iter().flat_map(|p| p.requests.iter().copied()).collect();
    let shares: Vec<&[u8]> = valid.iter().map(|p| p.entropy_share.as_bytes().as_slice()).collect();
    let mut timestamps: Vec<u64> = valid.iter().map(|p| p.timestamp_ms).collect();
    timestamps.sort_unstable();

    Ok(AgreedBatch {
        requests: requests.into_iter().collect(),
        contributors: valid.iter().map(|p| p.contributor).collect(),
        entropy: HashValue::digest_parts(&shares),
        timestamp_ms: timestamps[timestamps.len() / 2],
    })
}

/// Progress flags of a round. Several steps can be pending at once, so the
/// round is tracked as flags and [`RoundPhase`] is derived from them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundFlags {
    /// A solid state to build on was received.
    pub state_received: bool,
    /// This node submitted its proposal.
    pub proposal_sent: bool,
    /// The agreement primitive delivered a batch.
    pub batch_agreed: bool,
    /// The batch was handed to the VM runner.
    pub execution_started: bool,
    /// The VM runner returned a consistent result.
    pub execution_done: bool,
    /// A quorum of signatures was collected.
    pub signatures_collected: bool,
    /// The signed transaction was built.
    pub transaction_finalized: bool,
    /// The signed transaction was posted at least once.
    pub transaction_posted: bool,
    /// Inclusion state was polled at least once.
    pub inclusion_polled: bool,
    /// The ledger confirmed the transaction.
    pub transaction_seen: bool,
    /// The round is over, successfully or not.
    pub finished: bool,
}

/// Coarse round phase, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoundPhase {
    /// No solid state yet.
    #[default]
    Idle,
    /// Waiting for the proposal delay or for requests.
    ProposalPending,
    /// Waiting for the agreement primitive.
    AgreementPending,
    /// Waiting for the VM runner.
    Executing,
    /// Waiting for a quorum of signatures.
    SignatureCollection,
    /// Building the transaction.
    Finalizing,
    /// Transaction posted.
    Posted,
    /// Polling for inclusion.
    AwaitingInclusion,
    /// Round over.
    Done,
}

impl RoundFlags {
    /// Phase implied by the flags.
    pub fn phase(&self) -> RoundPhase {
        if !self.state_received {
            RoundPhase::Idle
        } else if self.finished {
            RoundPhase::Done
        } else if self.inclusion_polled {
            RoundPhase::AwaitingInclusion
        } else if self.transaction_posted {
            RoundPhase::Posted
        } else if self.signatures_collected {
            RoundPhase::Finalizing
        } else if self.execution_done {
            RoundPhase::SignatureCollection
        } else if self.batch_agreed {
            RoundPhase::Executing
        } else if self.proposal_sent {
            RoundPhase::AgreementPending
        } else {
            RoundPhase::ProposalPending
        }
    }
}

/// Execution result kept by the round.
#[derive(Debug, Clone)]
pub struct ExecutedBatch {
    /// Block produced.
    pub block: Block,
    /// State after the block.
    pub next_state: Arc<VirtualState>,
    /// Essence of the anchor transaction.
    pub essence: TransactionEssence,
    /// Hash of the essence; the message every member signs.
    pub essence_hash: HashValue,
}

/// Session id shared by all honest members for the round consuming `output`.
pub fn session_id(output: &StateOutput) -> u64 {
    HashValue::digest(&output.id.to_bytes()).prefix_u64()
}

/// State of one consensus round.
#[derive(Debug)]
pub struct RoundState {
    pub(crate) flags: RoundFlags,
    pub(crate) session_id: u64,
    pub(crate) solid_state: Option<Arc<VirtualState>>,
    pub(crate) output: Option<StateOutput>,
    pub(crate) propose_at: Option<Instant>,
    pub(crate) execute_at: Option<Instant>,
    pub(crate) batch: Option<AgreedBatch>,
    pub(crate) executed: Option<ExecutedBatch>,
    pub(crate) signatures: Option<SignatureCollector>,
    /// Signed results that arrived before our own execution finished.
    pub(crate) early_signatures: Vec<SignedResult>,
    pub(crate) transaction: Option<SignedTransaction>,
    pub(crate) next_post_at: Option<Instant>,
    pub(crate) post_deadline: Option<Instant>,
    pub(crate) next_poll_at: Option<Instant>,
    pub(crate) inclusion_deadline: Option<Instant>,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            flags: RoundFlags::default(),
            session_id: 0,
            solid_state: None,
            output: None,
            propose_at: None,
            execute_at: None,
            batch: None,
            executed: None,
            signatures: None,
            early_signatures: Vec::new(),
            transaction: None,
            next_post_at: None,
            post_deadline: None,
            next_poll_at: None,
            inclusion_deadline: None,
        }
    }
}

impl RoundState {
    /// A fresh round building on `solid_state`, committed by `output`.
    pub fn start(solid_state: Arc<VirtualState>, output: StateOutput, propose_at: Instant) -> Self {
        Self {
            flags: RoundFlags {
                state_received: true,
                ..Default::default()
            },
            session_id: session_id(&output),
            solid_state: Some(solid_state),
            output: Some(output),
            propose_at: Some(propose_at),
            ..Default::default()
        }
    }

    /// Progress flags.
    pub fn flags(&self) -> RoundFlags {
        self.flags
    }

    /// Session id of the round, zero when idle.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Solid state index the round builds on.
    pub fn state_index(&self) -> Option<u32> {
        self.solid_state.as_ref().map(|s| s.index())
    }

    /// The agreed batch, once known.
    pub fn batch(&self) -> Option<&AgreedBatch> {
        self.batch.as_ref()
    }

    /// The execution result, once known.
    pub fn executed(&self) -> Option<&ExecutedBatch> {
        self.executed.as_ref()
    }

    /// The finalized transaction, once built.
    pub fn transaction(&self) -> Option<&SignedTransaction> {
        self.transaction.as_ref()
    }

    /// Signatures collected so far.
    pub fn signature_count(&self) -> usize {
        self.signatures.as_ref().map_or(0, |s| s.count())
    }

    /// Whether this round was started from `output` and still stands.
    ///
    /// An abandoned round (finished without seeing its transaction) does not
    /// count, so the same output can start it again.
    pub(crate) fn is_for_output(&self, output: &StateOutput) -> bool {
        let abandoned = self.flags.finished && !self.flags.transaction_seen;
        self.flags.state_received
            && !abandoned
            && self.output.as_ref().is_some_and(|o| o.id == output.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{OutputId, RequestId, TransactionId};
    use proptest::prelude::*;

    fn req(n: u8) -> RequestId {
        RequestId::new(TransactionId(HashValue::digest(&[n])), 0)
    }

    fn proposal(contributor: MemberIndex, requests: &[u8], ts: u64) -> BatchProposal {
        BatchProposal {
            contributor,
            state_index: 7,
            requests: requests.iter().map(|n| req(*n)).collect(),
            entropy_share: HashValue::digest(&contributor.to_be_bytes()),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_merge_sorted_union() {
        let batch = merge_batch(
            &[proposal(2, &[3, 1], 30), proposal(0, &[1, 2], 10), proposal(1, &[], 20)],
            4,
            7,
        )
        .unwrap();

        let mut expected = vec![req(1), req(2), req(3)];
        expected.sort();
        assert_eq!(batch.requests, expected);
        assert_eq!(batch.contributors, vec![0, 1, 2]);
        assert_eq!(batch.timestamp_ms, 20);
        assert!(batch.has_contributor(1));
        assert!(!batch.has_contributor(3));
    }

    #[test]
    fn test_merge_skips_invalid_proposals() {
        let mut wrong_index = proposal(1, &[9], 10);
        wrong_index.state_index = 6;
        let batch = merge_batch(
            &[proposal(0, &[1], 10), wrong_index, proposal(5, &[8], 10), proposal(0, &[2], 10)],
            4,
            7,
        )
        .unwrap();
        assert_eq!(batch.contributors, vec![0]);
        assert_eq!(batch.requests.len(), 1);
    }

    #[test]
    fn test_merge_empty_is_error() {
        assert!(merge_batch(&[], 4, 7).is_err());
        assert!(merge_batch(&[proposal(9, &[1], 1)], 4, 7).is_err());
    }

    #[test]
    fn test_entropy_depends_on_contributors() {
        let a = merge_batch(&[proposal(0, &[1], 1), proposal(1, &[1], 1)], 4, 7).unwrap();
        let b = merge_batch(&[proposal(0, &[1], 1), proposal(2, &[1], 1)], 4, 7).unwrap();
        assert_ne!(a.entropy, b.entropy);
    }

    #[test]
    fn test_phase_follows_flags() {
        let mut flags = RoundFlags::default();
        assert_eq!(flags.phase(), RoundPhase::Idle);
        flags.state_received = true;
        assert_eq!(flags.phase(), RoundPhase::ProposalPending);
        flags.proposal_sent = true;
        assert_eq!(flags.phase(), RoundPhase::AgreementPending);
        flags.batch_agreed = true;
        flags.execution_started = true;
        assert_eq!(flags.phase(), RoundPhase::Executing);
        flags.execution_done = true;
        assert_eq!(flags.phase(), RoundPhase::SignatureCollection);
        flags.signatures_collected = true;
        flags.transaction_finalized = true;
        assert_eq!(flags.phase(), RoundPhase::Finalizing);
        flags.transaction_posted = true;
        assert_eq!(flags.phase(), RoundPhase::Posted);
        flags.inclusion_polled = true;
        assert_eq!(flags.phase(), RoundPhase::AwaitingInclusion);
        flags.finished = true;
        assert_eq!(flags.phase(), RoundPhase::Done);
    }

    #[test]
    fn test_session_id_from_output() {
        let a = StateOutput::new(OutputId::new(TransactionId(HashValue::digest(b"a")), 0), 1, HashValue::NIL, 0);
        let b = StateOutput::new(OutputId::new(TransactionId(HashValue::digest(b"b")), 0), 1, HashValue::NIL, 0);
        assert_eq!(session_id(&a), session_id(&a.clone()));
        assert_ne!(session_id(&a), session_id(&b));
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            raw in prop::collection::vec((0u16..6, prop::collection::vec(0u8..20, 0..5), 0u64..1000), 1..8),
            seed in any::<u64>(),
        ) {
            let proposals: Vec<BatchProposal> = raw
                .iter()
                .map(|(c, reqs, ts)| proposal(*c, reqs, *ts))
                .collect();
            let mut shuffled = proposals.clone();
            // Deterministic rotation plus reversal as a cheap shuffle.
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            if seed % 2 == 0 {
                shuffled.reverse();
            }

            let a = merge_batch(&proposals, 4, 7);
            let b = merge_batch(&shuffled, 4, 7);
            match (a, b) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(_), Err(_)) => {}
                _ => prop_assert!(false, "merge outcome depends on order"),
            }
        }
    }
}
