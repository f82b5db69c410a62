//! The state manager core.
//!
//! Owns the solid state of one chain and reconciles it with the anchor
//! outputs reported by the ledger. All methods take `&mut self`; the actor in
//! [`crate::actor`] is the only caller in a running node.

use crate::candidate::{Approval, CandidateBlock, CandidateTracker, Registration};
use crate::ports::{OutputFetcher, PeerNetwork, StateTransition, TransitionSink};
use crate::sync::SyncTracker;
use crate::{Result, StateManagerConfig, StateManagerError, StateManagerMetrics};
use keel_state::{Block, VirtualState};
use keel_storage::ChainStore;
use keel_types::{ChainAddress, Committee, HashValue, MemberIndex, RequestId, StateOutput};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Everything the state manager talks to.
#[derive(Clone)]
pub struct StateManagerContext {
    /// Committee of the chain.
    pub committee: Arc<dyn Committee>,
    /// Persistent store.
    pub store: Arc<dyn ChainStore>,
    /// Peer messaging.
    pub peers: Arc<dyn PeerNetwork>,
    /// Ledger pulls.
    pub fetcher: Arc<dyn OutputFetcher>,
    /// Receiver of state transitions.
    pub sink: Arc<dyn TransitionSink>,
}

/// Point-in-time view of the state manager, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateManagerStatus {
    /// Solid state index.
    pub solid_index: u32,
    /// Solid state hash.
    pub solid_hash: HashValue,
    /// Whether the solid state was confirmed by an anchor output.
    pub validated: bool,
    /// Largest evidenced state index.
    pub largest_evidenced: u32,
    /// Number of tracked candidates.
    pub candidates: usize,
    /// Whether the node is at most one index behind the evidence.
    pub synced: bool,
}

/// Solid state holder and synchronizer for one chain.
pub struct StateManager {
    chain: ChainAddress,
    ctx: StateManagerContext,
    config: StateManagerConfig,
    metrics: StateManagerMetrics,

    solid_state: Arc<VirtualState>,
    // Block that produced the solid state; `None` at origin.
    solid_block: Option<Block>,
    // Becomes true once an anchor output confirmed the solid state.
    solid_validated: bool,

    // Known anchor outputs at or above the solid index, with decoded hashes.
    outputs: BTreeMap<u32, (StateOutput, HashValue)>,
    candidates: CandidateTracker,
    sync: SyncTracker,
    processed: Vec<RequestId>,
    next_pull: Option<Instant>,
}

impl StateManager {
    /// Loads the last committed state or starts from the origin state.
    ///
    /// A failing or inconsistent store is fatal: the committee is dismissed
    /// and no state manager is returned.
    pub fn bootstrap(
        chain: ChainAddress,
        ctx: StateManagerContext,
        config: StateManagerConfig,
        metrics: StateManagerMetrics,
    ) -> Result<Self> {
        let loaded = match ctx.store.exists(&chain) {
            Ok(true) => match ctx.store.load(&chain) {
                Ok(pair) => Some(pair),
                Err(e) => return Err(Self::fatal(&ctx, e.into())),
            },
            Ok(false) => None,
            Err(e) => return Err(Self::fatal(&ctx, e.into())),
        };

        let (solid_state, solid_block) = match loaded {
            Some((state, block)) => {
                tracing::info!(
                    chain = %chain,
                    state_index = state.index(),
                    hash = %state.hash().short(),
                    approving = ?block.approving_output_id(),
                    "solid state loaded"
                );
                (state, Some(block))
            }
            None => {
                let origin = VirtualState::origin(chain);
                tracing::info!(chain = %chain, hash = %origin.hash().short(), "no stored state, starting from origin");
                (origin, None)
            }
        };

        let sync = SyncTracker::new(
            ctx.committee.peers(),
            config.sync_timeout,
            solid_state.index(),
            solid_state.hash(),
        );
        metrics.solid_state_index.set(solid_state.index() as i64);

        Ok(Self {
            chain,
            ctx,
            config,
            metrics,
            solid_state: Arc::new(solid_state),
            solid_block,
            solid_validated: false,
            outputs: BTreeMap::new(),
            candidates: CandidateTracker::new(),
            sync,
            processed: Vec::new(),
            next_pull: None,
        })
    }

    fn fatal(ctx: &StateManagerContext, err: StateManagerError) -> StateManagerError {
        tracing::error!(error = %err, "state bootstrap failed");
        ctx.committee.dismiss(&format!("state bootstrap failed: {err}"));
        err
    }

    /// Chain this manager serves.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// The current solid state.
    pub fn solid_state(&self) -> &Arc<VirtualState> {
        &self.solid_state
    }

    /// Whether the solid state has been confirmed by the ledger.
    pub fn is_validated(&self) -> bool {
        self.solid_validated
    }

    /// Whether the node is at most one index behind the evidence.
    pub fn is_synced(&self) -> bool {
        !self.sync.is_out_of_sync(self.solid_state.index())
    }

    /// The candidate tracker.
    pub fn candidates(&self) -> &CandidateTracker {
        &self.candidates
    }

    /// Current status.
    pub fn status(&self) -> StateManagerStatus {
        StateManagerStatus {
            solid_index: self.solid_state.index(),
            solid_hash: self.solid_state.hash(),
            validated: self.solid_validated,
            largest_evidenced: self.sync.largest_evidenced(),
            candidates: self.candidates.len(),
            synced: self.is_synced(),
        }
    }

    /// Records that the chain has reached at least `state_index` somewhere.
    pub fn evidence_index(&mut self, state_index: u32) {
        if self.sync.evidence(state_index) {
            self.metrics
                .evidenced_state_index
                .set(self.sync.largest_evidenced() as i64);
            if !self.is_synced() {
                tracing::info!(
                    solid_index = self.solid_state.index(),
                    evidenced = state_index,
                    "node is out of sync"
                );
            }
        }
    }

    /// Registers a candidate block and advances if it is already confirmed.
    ///
    /// `next_state` is given for blocks computed by this node. Returns `None`
    /// when the block is stale or inconsistent with the given state.
    pub fn register_candidate(
        &mut self,
        block: Block,
        next_state: Option<Arc<VirtualState>>,
    ) -> Result<Option<Registration>> {
        let index = block.index();
        if index <= self.solid_state.index() {
            tracing::debug!(state_index = index, solid_index = self.solid_state.index(), "stale candidate ignored");
            return Ok(None);
        }
        if let Some(state) = &next_state {
            if state.index() != index {
                tracing::warn!(
                    state_index = index,
                    next_state_index = state.index(),
                    "local candidate state does not match its block"
                );
                return Ok(None);
            }
        }

        let local = next_state.is_some();
        let registration = self.candidates.register(CandidateBlock::new(block, next_state));
        self.metrics.candidates_registered.inc();
        tracing::debug!(state_index = index, local, ?registration, "candidate registered");

        self.advance_and_announce()?;
        Ok(Some(registration))
    }

    /// Approves a candidate at `output.state_index` if the output confirms one.
    pub fn approve_if_matching_output(&mut self, output: &StateOutput, output_hash: HashValue) -> Approval {
        let approval = self.candidates.approve_if_matching_output(output, output_hash);
        match approval {
            Approval::Approved(key) => {
                self.metrics.candidates_approved.inc();
                tracing::debug!(state_index = output.state_index, block = %key.short(), "candidate approved");
            }
            Approval::NoMatch { conflicts } if conflicts > 0 => {
                self.metrics.conflicts.inc_by(conflicts as u64);
            }
            _ => {}
        }
        approval
    }

    fn approve_known(&mut self, index: u32) {
        if let Some((output, hash)) = self.outputs.get(&index).cloned() {
            self.approve_if_matching_output(&output, hash);
        }
    }

    /// Moves the solid state forward through approved candidates, strictly
    /// in index order. Returns how many indices were applied.
    ///
    /// A candidate whose replay fails or yields a hash other than the one the
    /// ledger committed is discarded and the solid state is left untouched.
    pub fn advance_solid_state(&mut self) -> Result<u32> {
        let mut advanced = 0;
        loop {
            let next_index = self.solid_state.index() + 1;
            self.approve_known(next_index);

            let Some((key, candidate)) = self.candidates.approved_at(next_index) else {
                break;
            };
            let expected = candidate.next_state_hash();
            let block = candidate.block().clone();
            let replayed = candidate.next_state(&self.solid_state);

            let next_state = match replayed {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(state_index = next_index, error = %e, "candidate replay failed");
                    self.candidates.discard(next_index, &key);
                    self.sync.fail_current();
                    return Err(e);
                }
            };
            if next_state.hash() != expected {
                tracing::error!(
                    state_index = next_index,
                    expected = %expected.short(),
                    computed = %next_state.hash().short(),
                    "replayed block does not match committed state"
                );
                self.metrics.conflicts.inc();
                self.candidates.discard(next_index, &key);
                self.sync.fail_current();
                return Err(StateManagerError::Conflict {
                    index: next_index,
                    expected,
                    computed: next_state.hash(),
                });
            }

            // The candidate stays approved if the commit fails and is retried on the next tick.
            self.ctx.store.commit(&next_state, &block)?;

            self.processed.extend(block.request_ids());
            self.solid_state = next_state;
            self.solid_block = Some(block);
            self.solid_validated = true;
            self.candidates.prune_up_to(next_index);
            self.outputs = self.outputs.split_off(&next_index);
            self.sync.reseed(self.solid_state.hash());
            self.metrics.solid_state_index.set(next_index as i64);
            advanced += 1;

            tracing::info!(
                state_index = next_index,
                hash = %self.solid_state.hash().short(),
                "solid state advanced"
            );
        }
        Ok(advanced)
    }

    fn advance_and_announce(&mut self) -> Result<()> {
        if self.advance_solid_state()? > 0 {
            self.announce_if_current();
        }
        Ok(())
    }

    /// Announces the solid state if it matches the latest known anchor output.
    fn announce_if_current(&mut self) {
        let solid_index = self.solid_state.index();
        let Some((&latest_index, (output, hash))) = self.outputs.iter().next_back() else {
            return;
        };
        if latest_index != solid_index || *hash != self.solid_state.hash() {
            return;
        }
        let transition = StateTransition {
            solid_state: self.solid_state.clone(),
            output: output.clone(),
            processed: std::mem::take(&mut self.processed),
        };
        tracing::debug!(state_index = solid_index, output = %transition.output.id, "state transition");
        self.ctx.sink.on_state_transition(transition);
    }

    /// Handles an anchor output reported by the ledger.
    pub fn on_state_output(&mut self, output: StateOutput) -> Result<()> {
        let output_hash = match output.state_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(output = %output.id, error = %e, "malformed anchor output");
                return Err(e.into());
            }
        };
        self.evidence_index(output.state_index);

        let solid_index = self.solid_state.index();
        if output.state_index < solid_index {
            tracing::debug!(state_index = output.state_index, solid_index, "stale anchor output");
            return Ok(());
        }
        self.outputs
            .insert(output.state_index, (output.clone(), output_hash));

        if output.state_index == solid_index {
            if output_hash != self.solid_state.hash() {
                self.metrics.conflicts.inc();
                let err = StateManagerError::Conflict {
                    index: solid_index,
                    expected: output_hash,
                    computed: self.solid_state.hash(),
                };
                if !self.solid_validated {
                    return Err(Self::fatal(&self.ctx, err));
                }
                tracing::error!(error = %err, "anchor output contradicts solid state");
                return Err(err);
            }
            if !self.solid_validated {
                tracing::info!(state_index = solid_index, "solid state validated");
                self.solid_validated = true;
            }
            // Re-delivered outputs re-announce, restarting an aborted round.
            self.announce_if_current();
            return Ok(());
        }

        self.advance_and_announce()
    }

    /// Handles a block relayed by a peer.
    pub fn on_block_from_peer(&mut self, sender: MemberIndex, block: Block) -> Result<()> {
        let index = block.index();
        if index <= self.solid_state.index() {
            tracing::debug!(peer = sender, state_index = index, "stale block from peer");
            return Ok(());
        }
        let Some(approving) = block.approving_output_id() else {
            tracing::warn!(peer = sender, state_index = index, "peer block without approving output dropped");
            return Ok(());
        };
        tracing::debug!(peer = sender, state_index = index, %approving, "block from peer");

        self.evidence_index(index);
        self.sync.on_block(index);
        if !self.outputs.contains_key(&index) {
            self.ctx.fetcher.pull_confirmed_output(&self.chain, &approving);
        }
        self.register_candidate(block, None)?;
        Ok(())
    }

    /// Answers a peer's block request from the solid block or storage.
    pub fn on_get_block(&mut self, sender: MemberIndex, state_index: u32) {
        let block = match &self.solid_block {
            Some(block) if block.index() == state_index => Some(block.clone()),
            _ => match self.ctx.store.load_block(&self.chain, state_index) {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!(peer = sender, state_index, error = %e, "failed to load requested block");
                    None
                }
            },
        };
        match block {
            Some(block) => self.ctx.peers.send_block(sender, &block),
            None => tracing::debug!(peer = sender, state_index, "requested block not available"),
        }
    }

    /// Periodic work: retries, ledger pulls and peer synchronization.
    pub fn on_timer(&mut self, now: Instant) {
        if let Err(e) = self.advance_and_announce() {
            tracing::warn!(error = %e, "advance retry failed");
        }

        if self.next_pull.map_or(true, |at| now >= at) {
            self.ctx.fetcher.pull_state(&self.chain);
            self.next_pull = Some(now + self.config.pull_state_interval);
        }

        // One index behind is normal while a round is in flight. Peers are
        // asked only when out of sync, or when the ledger already confirmed
        // the next index and no candidate here matches it.
        let next_index = self.solid_state.index() + 1;
        let confirmed_missing = self.outputs.contains_key(&next_index);
        let wanted = ((!self.is_synced() || confirmed_missing)
            && self.candidates.approved_at(next_index).is_none())
        .then_some(next_index);
        if let Some(request) = self.sync.poll(now, wanted) {
            self.metrics.sync_requests.inc();
            tracing::debug!(peer = request.peer, state_index = request.state_index, "requesting block");
            self.ctx.peers.request_block(request.peer, request.state_index);
        }
    }
}
