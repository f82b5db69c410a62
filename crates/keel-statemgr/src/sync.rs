//! Peer synchronization bookkeeping.
//!
//! Missing blocks are requested from one peer at a time. Peers are visited in
//! a pseudo-random order derived from a seed (the solid state hash), so every
//! node lagging at the same state spreads its requests the same way. When a
//! full pass over the permutation yields nothing, a fresh order is derived
//! from the seed and the cycle number.

use keel_types::{HashValue, MemberIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::time::Instant;

/// A block request waiting for an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Peer asked.
    pub peer: MemberIndex,
    /// State index requested.
    pub state_index: u32,
    /// When to give up on this peer.
    pub deadline: Instant,
}

/// Deterministic permutation of `peers` for `seed`.
pub fn peer_permutation(peers: &[MemberIndex], seed: &HashValue) -> Vec<MemberIndex> {
    let mut order = peers.to_vec();
    let mut rng = ChaCha8Rng::from_seed(*seed.as_bytes());
    order.shuffle(&mut rng);
    order
}

/// Tracks how far behind the ledger this node is and whom to ask next.
#[derive(Debug)]
pub struct SyncTracker {
    peers: Vec<MemberIndex>,
    timeout: Duration,
    largest_evidenced: u32,
    seed: HashValue,
    cycle: u64,
    order: Vec<MemberIndex>,
    cursor: usize,
    pending: Option<PendingRequest>,
}

impl SyncTracker {
    /// Creates a tracker over `peers` seeded with the current solid state hash.
    pub fn new(peers: Vec<MemberIndex>, timeout: Duration, solid_index: u32, seed: HashValue) -> Self {
        let order = peer_permutation(&peers, &seed);
        Self {
            peers,
            timeout,
            largest_evidenced: solid_index,
            seed,
            cycle: 0,
            order,
            cursor: 0,
            pending: None,
        }
    }

    /// Records that some peer or the ledger has reached `state_index`.
    ///
    /// Returns true if this raised the largest evidenced index.
    pub fn evidence(&mut self, state_index: u32) -> bool {
        if state_index > self.largest_evidenced {
            self.largest_evidenced = state_index;
            return true;
        }
        false
    }

    /// Largest state index evidenced so far.
    pub fn largest_evidenced(&self) -> u32 {
        self.largest_evidenced
    }

    /// Whether the node is more than one index behind the evidence.
    pub fn is_out_of_sync(&self, solid_index: u32) -> bool {
        self.largest_evidenced > solid_index.saturating_add(1)
    }

    /// Restarts the permutation for a new solid state.
    pub fn reseed(&mut self, seed: HashValue) {
        if seed == self.seed {
            return;
        }
        self.seed = seed;
        self.cycle = 0;
        self.order = peer_permutation(&self.peers, &seed);
        self.cursor = 0;
        self.pending = None;
    }

    /// The permutation currently being walked.
    pub fn order(&self) -> &[MemberIndex] {
        &self.order
    }

    /// The request in flight, if any.
    pub fn pending(&self) -> Option<PendingRequest> {
        self.pending
    }

    fn next_peer(&mut self) -> Option<MemberIndex> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.cycle += 1;
            let cycle_seed = HashValue::digest_parts(&[self.seed.as_bytes(), &self.cycle.to_be_bytes()]);
            self.order = peer_permutation(&self.peers, &cycle_seed);
            self.cursor = 0;
            tracing::debug!(cycle = self.cycle, "sync permutation exhausted, reshuffled");
        }
        let peer = self.order[self.cursor];
        self.cursor += 1;
        Some(peer)
    }

    /// Decides whether a block request should be sent now.
    ///
    /// `wanted` is the index to request, or `None` when nothing is missing.
    /// At most one request is in flight; an unanswered request moves on to
    /// the next peer after the timeout.
    pub fn poll(&mut self, now: Instant, wanted: Option<u32>) -> Option<PendingRequest> {
        let Some(state_index) = wanted else {
            self.pending = None;
            return None;
        };
        if let Some(pending) = self.pending {
            if pending.state_index == state_index && now < pending.deadline {
                return None;
            }
            if pending.state_index == state_index {
                tracing::debug!(peer = pending.peer, state_index, "sync request timed out");
            }
        }
        let peer = self.next_peer()?;
        let request = PendingRequest {
            peer,
            state_index,
            deadline: now + self.timeout,
        };
        self.pending = Some(request);
        Some(request)
    }

    /// Clears the in-flight request once the block for it arrived.
    pub fn on_block(&mut self, state_index: u32) {
        if self.pending.is_some_and(|p| p.state_index == state_index) {
            self.pending = None;
        }
    }

    /// Abandons the in-flight request so the next poll asks another peer.
    pub fn fail_current(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!(peer = pending.peer, state_index = pending.state_index, "sync attempt failed");
        }
    }
}
