//! Candidate blocks awaiting ledger confirmation.
//!
//! Candidates live in an arena keyed by `(state index, block essence hash)`.
//! Entries are never shared outside the state manager and are dropped as a
//! whole once their index is superseded by the solid state.
//!
//! The essence hash excludes the approving output id, so relayed copies of
//! one block that declare different anchor outputs share an entry. The entry
//! keeps every declared output; a single peer relaying a wrong one cannot
//! hide the copies that declare the confirmed output.

use crate::Result;
use keel_state::{Block, VirtualState};
use keel_types::{HashValue, OutputId, StateOutput};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An unconfirmed state transition.
#[derive(Debug, Clone)]
pub struct CandidateBlock {
    block: Block,
    local: bool,
    votes: usize,
    approved: bool,
    next_state_hash: HashValue,
    next_state: Option<Arc<VirtualState>>,
    declared: Vec<OutputId>,
}

/// Result of matching a candidate against an anchor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Match {
    /// The candidate was approved by the output.
    Approved,
    /// The output does not refer to this candidate.
    NoMatch,
    /// The candidate claims a different anchor output for the same index.
    Conflict {
        /// Output the candidate declared.
        declared: OutputId,
    },
}

impl CandidateBlock {
    /// Creates a candidate. Passing the computed next state makes it local.
    pub fn new(block: Block, next_state: Option<Arc<VirtualState>>) -> Self {
        let next_state_hash = next_state
            .as_ref()
            .map(|s| s.hash())
            .unwrap_or(HashValue::NIL);
        let declared = block.approving_output_id().into_iter().collect();
        Self {
            block,
            local: next_state.is_some(),
            votes: 1,
            approved: false,
            next_state_hash,
            next_state,
            declared,
        }
    }

    /// The wrapped block.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Whether this node computed the next state itself.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Number of times this block was registered.
    pub fn votes(&self) -> usize {
        self.votes
    }

    /// Anchor outputs declared by the relayed copies of this block.
    pub fn declared_outputs(&self) -> &[OutputId] {
        &self.declared
    }

    fn add_vote(&mut self) {
        self.votes += 1;
    }

    fn merge_declared(&mut self, other: &[OutputId]) {
        for id in other {
            if !self.declared.contains(id) {
                self.declared.push(*id);
            }
        }
    }

    /// Whether the ledger confirmed this candidate.
    pub fn is_approved(&self) -> bool {
        self.approved
    }

    /// Declared next state hash. `NIL` for unapproved remote candidates.
    pub fn next_state_hash(&self) -> HashValue {
        self.next_state_hash
    }

    /// Approves the candidate if `output` confirms it.
    ///
    /// Local candidates match on the committed state hash, remote ones on the
    /// anchor output id their block declares.
    fn approve_if_matching(&mut self, output: &StateOutput, output_hash: HashValue) -> Match {
        if self.block.index() != output.state_index {
            return Match::NoMatch;
        }
        if self.local {
            if self.next_state_hash == output_hash {
                self.approved = true;
                self.block.set_approving_output_id(output.id);
                return Match::Approved;
            }
            return Match::NoMatch;
        }
        if self.declared.contains(&output.id) {
            self.approved = true;
            self.next_state_hash = output_hash;
            self.block.set_approving_output_id(output.id);
            return Match::Approved;
        }
        match self.declared.first() {
            Some(declared) => Match::Conflict { declared: *declared },
            None => Match::NoMatch,
        }
    }

    /// Materializes the next state: directly if local, by replay otherwise.
    pub fn next_state(&self, current: &VirtualState) -> Result<Arc<VirtualState>> {
        match &self.next_state {
            Some(state) => Ok(state.clone()),
            None => Ok(Arc::new(current.apply_block(&self.block)?)),
        }
    }
}

/// Outcome of [`CandidateTracker::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new candidate was added.
    Added,
    /// An identical candidate existed; its vote count was incremented.
    Voted,
    /// A local candidate replaced an identical remote one.
    ReplacedRemote,
}

/// Outcome of [`CandidateTracker::approve_if_matching_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// A candidate was approved by this call.
    Approved(HashValue),
    /// A candidate at this index was already approved.
    AlreadyApproved(HashValue),
    /// Nothing matched.
    NoMatch {
        /// Candidates that declared a different anchor output.
        conflicts: usize,
    },
}

/// Arena of candidate blocks keyed by state index and block essence hash.
#[derive(Debug, Default)]
pub struct CandidateTracker {
    candidates: BTreeMap<u32, HashMap<HashValue, CandidateBlock>>,
}

impl CandidateTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a candidate, merging it with an identical one if present.
    ///
    /// A local candidate always takes precedence over a remote one for the
    /// same block since it already carries the materialized state. Relayed
    /// copies merge their declared anchor outputs into the existing entry.
    pub fn register(&mut self, candidate: CandidateBlock) -> Registration {
        let key = candidate.block.essence_hash();
        let at_index = self.candidates.entry(candidate.block.index()).or_default();
        match at_index.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                Registration::Added
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if candidate.local && !existing.local && !existing.approved {
                    let votes = existing.votes + 1;
                    *existing = candidate;
                    existing.votes = votes;
                    Registration::ReplacedRemote
                } else {
                    if !existing.local && !existing.approved {
                        existing.merge_declared(&candidate.declared);
                    }
                    existing.add_vote();
                    Registration::Voted
                }
            }
        }
    }

    /// Approves at most one candidate at `output.state_index`.
    ///
    /// Idempotent: once a candidate at an index is approved, later calls
    /// report it without re-scanning. Remote candidates declaring a different
    /// anchor output are counted as conflicts and stay unapproved.
    pub fn approve_if_matching_output(&mut self, output: &StateOutput, output_hash: HashValue) -> Approval {
        let Some(at_index) = self.candidates.get_mut(&output.state_index) else {
            return Approval::NoMatch { conflicts: 0 };
        };
        if let Some((key, _)) = at_index.iter().find(|(_, c)| c.approved) {
            return Approval::AlreadyApproved(*key);
        }

        let mut conflicts = 0;
        for (key, candidate) in at_index.iter_mut() {
            match candidate.approve_if_matching(output, output_hash) {
                Match::Approved => return Approval::Approved(*key),
                Match::Conflict { declared } => {
                    conflicts += 1;
                    tracing::warn!(
                        state_index = output.state_index,
                        block = %key.short(),
                        %declared,
                        confirmed = %output.id,
                        "candidate declares a different anchor output"
                    );
                }
                Match::NoMatch => {}
            }
        }
        Approval::NoMatch { conflicts }
    }

    /// The approved candidate at `index`, if any.
    pub fn approved_at(&self, index: u32) -> Option<(HashValue, &CandidateBlock)> {
        self.candidates
            .get(&index)?
            .iter()
            .find(|(_, c)| c.approved)
            .map(|(k, c)| (*k, c))
    }

    /// Looks up a candidate.
    pub fn get(&self, index: u32, key: &HashValue) -> Option<&CandidateBlock> {
        self.candidates.get(&index)?.get(key)
    }

    /// Removes one candidate.
    pub fn discard(&mut self, index: u32, key: &HashValue) -> Option<CandidateBlock> {
        let at_index = self.candidates.get_mut(&index)?;
        let removed = at_index.remove(key);
        if at_index.is_empty() {
            self.candidates.remove(&index);
        }
        removed
    }

    /// Drops every candidate at or below `index`.
    pub fn prune_up_to(&mut self, index: u32) -> usize {
        let keep = match index.checked_add(1) {
            Some(next) => self.candidates.split_off(&next),
            None => BTreeMap::new(),
        };
        let dropped = std::mem::replace(&mut self.candidates, keep);
        dropped.values().map(|m| m.len()).sum()
    }

    /// Number of candidates at `index`.
    pub fn count_at(&self, index: u32) -> usize {
        self.candidates.get(&index).map(|m| m.len()).unwrap_or(0)
    }

    /// Total number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.values().map(|m| m.len()).sum()
    }

    /// Whether no candidates are tracked.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{Mutation, StateUpdate};
    use keel_types::{ChainAddress, RequestId, TransactionId};
    use proptest::prelude::*;

    fn origin() -> VirtualState {
        VirtualState::origin(ChainAddress::from_seed("tracker"))
    }

    fn block(index: u32, value: &str) -> Block {
        let id = RequestId::new(TransactionId(HashValue::digest(value.as_bytes())), 0);
        Block::new(index, 0, vec![StateUpdate::for_request(id, 0, vec![Mutation::set("k", value)])]).unwrap()
    }

    fn output(index: u32, tx: &[u8], hash: HashValue) -> StateOutput {
        StateOutput::new(OutputId::new(TransactionId(HashValue::digest(tx)), 0), index, hash, 0)
    }

    fn local(block: &Block) -> CandidateBlock {
        let next = origin().apply_block(block).unwrap();
        CandidateBlock::new(block.clone(), Some(Arc::new(next)))
    }

    fn remote(block: &Block, approving: OutputId) -> CandidateBlock {
        let mut block = block.clone();
        block.set_approving_output_id(approving);
        CandidateBlock::new(block, None)
    }

    #[test]
    fn test_duplicate_adds_vote() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        assert_eq!(tracker.register(local(&b)), Registration::Added);
        assert_eq!(tracker.register(local(&b)), Registration::Voted);
        assert_eq!(tracker.count_at(1), 1);
        assert_eq!(tracker.get(1, &b.essence_hash()).unwrap().votes(), 2);
    }

    #[test]
    fn test_local_replaces_remote() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        tracker.register(remote(&b, OutputId::default()));
        assert_eq!(tracker.register(local(&b)), Registration::ReplacedRemote);

        let kept = tracker.get(1, &b.essence_hash()).unwrap();
        assert!(kept.is_local());
        assert_eq!(kept.votes(), 2);
        assert_eq!(tracker.len(), 1);

        // A remote duplicate arriving later only votes.
        assert_eq!(tracker.register(remote(&b, OutputId::default())), Registration::Voted);
        assert!(tracker.get(1, &b.essence_hash()).unwrap().is_local());
    }

    #[test]
    fn test_local_approval_by_hash() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        let cand = local(&b);
        let hash = cand.next_state_hash();
        tracker.register(cand);

        let out = output(1, b"tx1", hash);
        assert_eq!(tracker.approve_if_matching_output(&out, hash), Approval::Approved(b.essence_hash()));
        let (_, approved) = tracker.approved_at(1).unwrap();
        assert_eq!(approved.block().approving_output_id(), Some(out.id));
    }

    #[test]
    fn test_local_hash_mismatch_is_not_approved() {
        let mut tracker = CandidateTracker::new();
        tracker.register(local(&block(1, "a")));
        let wrong = HashValue::digest(b"other");
        let out = output(1, b"tx1", wrong);
        assert_eq!(
            tracker.approve_if_matching_output(&out, wrong),
            Approval::NoMatch { conflicts: 0 }
        );
        assert!(tracker.approved_at(1).is_none());
    }

    #[test]
    fn test_remote_approval_by_output_id() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        let out = output(1, b"tx1", HashValue::digest(b"h"));
        tracker.register(remote(&b, out.id));

        let hash = out.state_hash().unwrap();
        assert_eq!(tracker.approve_if_matching_output(&out, hash), Approval::Approved(b.essence_hash()));
        assert_eq!(tracker.approved_at(1).unwrap().1.next_state_hash(), hash);
    }

    #[test]
    fn test_remote_with_other_output_is_conflict() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        let declared = output(1, b"tx-declared", HashValue::NIL).id;
        tracker.register(remote(&b, declared));

        let out = output(1, b"tx-confirmed", HashValue::digest(b"h"));
        let hash = out.state_hash().unwrap();
        assert_eq!(
            tracker.approve_if_matching_output(&out, hash),
            Approval::NoMatch { conflicts: 1 }
        );
        assert!(tracker.approved_at(1).is_none());
        assert_eq!(tracker.count_at(1), 1);
    }

    #[test]
    fn test_wrong_declaration_does_not_shadow_honest_copy() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        let bad = output(1, b"tx-bad", HashValue::NIL).id;
        let good = output(1, b"tx-good", HashValue::digest(b"h"));

        assert_eq!(tracker.register(remote(&b, bad)), Registration::Added);
        assert_eq!(tracker.register(remote(&b, good.id)), Registration::Voted);
        assert_eq!(tracker.count_at(1), 1);
        assert_eq!(
            tracker.get(1, &b.essence_hash()).unwrap().declared_outputs(),
            &[bad, good.id]
        );

        let hash = good.state_hash().unwrap();
        assert_eq!(
            tracker.approve_if_matching_output(&good, hash),
            Approval::Approved(b.essence_hash())
        );
        let (_, approved) = tracker.approved_at(1).unwrap();
        assert_eq!(approved.block().approving_output_id(), Some(good.id));
        assert_eq!(approved.next_state_hash(), hash);
    }

    #[test]
    fn test_approval_is_idempotent() {
        let mut tracker = CandidateTracker::new();
        let b = block(1, "a");
        let cand = local(&b);
        let hash = cand.next_state_hash();
        tracker.register(cand);
        let out = output(1, b"tx1", hash);

        assert!(matches!(tracker.approve_if_matching_output(&out, hash), Approval::Approved(_)));
        assert!(matches!(
            tracker.approve_if_matching_output(&out, hash),
            Approval::AlreadyApproved(_)
        ));
    }

    #[test]
    fn test_prune_up_to() {
        let mut tracker = CandidateTracker::new();
        tracker.register(local(&block(1, "a")));
        tracker.register(remote(&block(1, "b"), OutputId::default()));
        tracker.register(remote(&block(2, "c"), OutputId::default()));
        tracker.register(remote(&block(3, "d"), OutputId::default()));

        assert_eq!(tracker.prune_up_to(2), 3);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.count_at(3), 1);
    }

    #[test]
    fn test_remote_next_state_replays() {
        let b = block(1, "a");
        let cand = remote(&b, OutputId::default());
        let next = cand.next_state(&origin()).unwrap();
        assert_eq!(next.index(), 1);
        assert_eq!(next.get(b"k"), Some(&b"a"[..]));

        let wrong_base = origin().apply_block(&b).unwrap();
        assert!(cand.next_state(&wrong_base).is_err());
    }

    proptest! {
        #[test]
        fn prop_at_most_one_approval_per_index(
            values in proptest::collection::vec("[a-d]", 1..8),
            repeats in 1usize..4,
        ) {
            let mut tracker = CandidateTracker::new();
            let mut hashes = Vec::new();
            for v in &values {
                let cand = local(&block(1, v));
                hashes.push(cand.next_state_hash());
                tracker.register(cand);
            }

            let mut newly_approved = 0;
            for hash in &hashes {
                let out = output(1, hash.as_bytes(), *hash);
                for _ in 0..repeats {
                    if let Approval::Approved(_) = tracker.approve_if_matching_output(&out, *hash) {
                        newly_approved += 1;
                    }
                }
            }
            prop_assert_eq!(newly_approved, 1);
        }
    }
}
