//! Consensus engine core.
//!
//! [`Consensus`] drives one round per solid state: propose a batch, wait for
//! the committee to agree on one, execute it, collect a quorum of partial
//! signatures over the resulting essence, then post the anchor transaction
//! and poll for its inclusion. Every handler takes the current time so the
//! whole workflow can be driven deterministically; the actor feeds it from
//! its mailbox and timer.

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::metrics::ConsensusMetrics;
use crate::ports::{
    Agreement, CandidateSink, InclusionState, Mempool, MempoolStats, NodeConnection,
    ResultBroadcast, VmError, VmOutput, VmRunner, VmTask,
};
use crate::round::{merge_batch, BatchProposal, ExecutedBatch, RoundPhase, RoundState};
use crate::signatures::{Collected, SignatureCollector};
use keel_p2p::SignedResult;
use keel_statemgr::StateTransition;
use keel_types::{ChainAddress, Committee, HashValue, MemberIndex, SignedTransaction, TransactionId};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Collaborators of the consensus engine.
#[derive(Clone)]
pub struct ConsensusContext {
    /// Committee running the chain.
    pub committee: Arc<dyn Committee>,
    /// Pending requests.
    pub mempool: Arc<dyn Mempool>,
    /// Batch executor.
    pub vm: Arc<dyn VmRunner>,
    /// Agreement primitive.
    pub agreement: Arc<dyn Agreement>,
    /// Ledger connection.
    pub node: Arc<dyn NodeConnection>,
    /// Partial signature delivery.
    pub peers: Arc<dyn ResultBroadcast>,
    /// The state manager.
    pub candidates: Arc<dyn CandidateSink>,
}

/// Read-only view of the engine for observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusStatus {
    /// Solid state index of the current round.
    pub state_index: Option<u32>,
    /// Round phase.
    pub phase: RoundPhase,
    /// Round session id.
    pub session_id: u64,
    /// Signatures collected in this round.
    pub signatures: usize,
    /// Committee size.
    pub committee_size: usize,
    /// Signature quorum.
    pub quorum: usize,
    /// Whether the committee reported ready.
    pub ready: bool,
    /// Timer ticks processed.
    pub timer_ticks: u64,
    /// Mempool contents.
    pub mempool: MempoolStats,
}

/// A batch ready to run on the VM, off the event loop.
pub struct ExecutionJob {
    session_id: u64,
    vm: Arc<dyn VmRunner>,
    task: VmTask,
}

impl ExecutionJob {
    /// Session the job belongs to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The task handed to the VM.
    pub fn task(&self) -> &VmTask {
        &self.task
    }

    /// Runs the VM. Blocking.
    pub fn run(self) -> ExecutionOutcome {
        ExecutionOutcome {
            session_id: self.session_id,
            result: self.vm.run(self.task),
        }
    }
}

/// What the VM produced for a session.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Session the result belongs to.
    pub session_id: u64,
    /// VM output or error.
    pub result: std::result::Result<VmOutput, VmError>,
}

/// The consensus engine of one chain.
pub struct Consensus {
    chain: ChainAddress,
    ctx: ConsensusContext,
    config: ConsensusConfig,
    metrics: ConsensusMetrics,
    round: RoundState,
    job: Option<ExecutionJob>,
    /// Signed results for rounds this node has not started yet.
    backlog: Vec<SignedResult>,
    timer_ticks: u64,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Consensus {
    /// Creates an idle engine. Rounds start with the first state transition.
    pub fn new(
        chain: ChainAddress,
        ctx: ConsensusContext,
        config: ConsensusConfig,
        metrics: ConsensusMetrics,
    ) -> Self {
        Self {
            chain,
            ctx,
            config,
            metrics,
            round: RoundState::default(),
            job: None,
            backlog: Vec::new(),
            timer_ticks: 0,
        }
    }

    /// The chain this engine runs.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// The current round.
    pub fn round(&self) -> &RoundState {
        &self.round
    }

    /// Takes the execution job prepared by the last event, if any.
    pub fn take_execution_job(&mut self) -> Option<ExecutionJob> {
        self.job.take()
    }

    fn own_index(&self) -> MemberIndex {
        self.ctx.committee.own_index()
    }

    /// Starts a fresh round on a new solid state.
    ///
    /// Requests processed by the transition leave the mempool. A repeated
    /// transition for the output the current round already builds on is
    /// ignored; after an abort the same transition starts a clean round.
    pub fn on_state_transition(&mut self, now: Instant, transition: StateTransition) {
        self.ctx.mempool.remove_requests(&transition.processed);

        if self.round.is_for_output(&transition.output) {
            tracing::debug!(output = %transition.output.id, "duplicate state transition ignored");
            return;
        }
        let state_index = transition.solid_state.index();
        if transition.output.state_index != state_index {
            tracing::warn!(
                state_index,
                output_index = transition.output.state_index,
                "state transition does not match its output"
            );
            return;
        }
        if let Some(previous) = self.round.state_index() {
            if !self.round.flags().finished {
                tracing::debug!(previous, phase = ?self.round.flags().phase(), "unfinished round cancelled");
            }
        }

        self.job = None;
        self.round = RoundState::start(
            transition.solid_state,
            transition.output,
            now + self.config.proposal_delay,
        );
        let session_id = self.round.session_id();
        self.metrics.rounds_started.inc();
        self.metrics.state_index.set(state_index as i64);
        tracing::info!(state_index, session_id, "round started");

        let (current, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.backlog)
            .into_iter()
            .partition(|r| r.session_id == session_id);
        self.backlog = rest.into_iter().filter(|r| r.state_index > state_index).collect();
        self.round.early_signatures = current;
    }

    /// Periodic work: mempool reaping, proposal after the delay, delayed
    /// execution, transaction re-posts and inclusion polls.
    pub fn on_timer_tick(&mut self, now: Instant) {
        self.timer_ticks += 1;
        self.ctx.mempool.reap_expired();
        let flags = self.round.flags();
        if !flags.state_received || flags.finished {
            return;
        }
        if !flags.proposal_sent && self.round.propose_at.is_some_and(|at| now >= at) {
            self.propose_batch();
        }
        if flags.batch_agreed
            && !flags.execution_started
            && self.round.execute_at.is_some_and(|at| now >= at)
        {
            self.run_execution();
        }
        if flags.transaction_posted {
            self.drive_inclusion(now);
        }
    }

    /// Submits this node's batch to the agreement primitive.
    ///
    /// Returns false when there are not enough ready requests yet.
    pub fn propose_batch(&mut self) -> bool {
        let flags = self.round.flags();
        if !flags.state_received || flags.proposal_sent || flags.finished {
            return false;
        }
        let Some(state) = self.round.solid_state.clone() else {
            return false;
        };
        let ready = self.ctx.mempool.ready_requests(self.config.max_batch);
        if ready.is_empty() || ready.len() < self.config.min_batch {
            tracing::trace!(ready = ready.len(), "not enough requests to propose");
            return false;
        }

        let session_id = self.round.session_id();
        let share = self.ctx.committee.sign(&session_id.to_be_bytes());
        let proposal = BatchProposal {
            contributor: self.own_index(),
            state_index: state.index(),
            requests: ready.iter().map(|r| r.id).collect(),
            entropy_share: HashValue::digest(&share.to_bytes()),
            timestamp_ms: unix_millis().max(state.timestamp_ms()),
        };
        tracing::debug!(
            state_index = state.index(),
            requests = proposal.requests.len(),
            "proposing batch"
        );
        self.ctx.agreement.propose(session_id, proposal);
        self.round.flags.proposal_sent = true;
        true
    }

    /// Handles the proposals the committee agreed on for `session_id`.
    pub fn on_agreement_result(
        &mut self,
        now: Instant,
        session_id: u64,
        proposals: Vec<BatchProposal>,
    ) -> Result<()> {
        let flags = self.round.flags();
        if !flags.state_received || flags.finished || session_id != self.round.session_id() {
            tracing::debug!(session_id, "agreement result for another round ignored");
            return Ok(());
        }
        if flags.batch_agreed {
            tracing::debug!(session_id, "duplicate agreement result ignored");
            return Ok(());
        }
        let Some(state_index) = self.round.state_index() else {
            return Ok(());
        };

        let batch = merge_batch(&proposals, self.ctx.committee.size(), state_index)?;
        tracing::debug!(
            state_index,
            requests = batch.requests.len(),
            contributors = ?batch.contributors,
            contributed = batch.has_contributor(self.own_index()),
            "batch agreed"
        );
        self.round.batch = Some(batch);
        self.round.flags.batch_agreed = true;

        let execute_at = now + self.config.execution_delay;
        self.round.execute_at = Some(execute_at);
        if now >= execute_at {
            self.run_execution();
        }
        Ok(())
    }

    /// Prepares the agreed batch for the VM runner.
    ///
    /// The job is picked up with [`Consensus::take_execution_job`]. Returns
    /// false while some agreed requests are still missing from the mempool.
    pub fn run_execution(&mut self) -> bool {
        let flags = self.round.flags();
        if !flags.batch_agreed || flags.execution_started || flags.finished {
            return false;
        }
        let (Some(batch), Some(state), Some(output)) = (
            self.round.batch.as_ref(),
            self.round.solid_state.clone(),
            self.round.output.as_ref(),
        ) else {
            return false;
        };

        let (requests, missing) = self.ctx.mempool.get_requests(&batch.requests);
        if !missing.is_empty() {
            tracing::debug!(missing = missing.len(), "agreed requests not in mempool yet");
            return false;
        }

        let task = VmTask {
            chain: self.chain,
            state,
            consumed_output: output.id,
            requests,
            entropy: batch.entropy,
            timestamp_ms: batch.timestamp_ms,
        };
        self.job = Some(ExecutionJob {
            session_id: self.round.session_id(),
            vm: self.ctx.vm.clone(),
            task,
        });
        self.round.flags.execution_started = true;
        true
    }

    fn check_output(&self, output: &VmOutput) -> Result<()> {
        let (Some(state), Some(consumed)) = (&self.round.solid_state, &self.round.output) else {
            return Err(ConsensusError::Execution("no round in progress".into()));
        };
        let expected = state.index() + 1;
        let essence = &output.essence;
        if output.block.index() != expected || output.next_state.index() != expected {
            return Err(ConsensusError::Execution(format!(
                "vm produced index {} for expected {expected}",
                output.block.index()
            )));
        }
        if essence.chain != self.chain
            || essence.consumed_output != consumed.id
            || essence.state_index != expected
            || essence.state_hash != output.next_state.hash()
            || !essence.requests.iter().copied().eq(output.block.request_ids())
        {
            return Err(ConsensusError::Execution(
                "essence does not commit the produced state".into(),
            ));
        }
        Ok(())
    }

    fn abort_round(&mut self, reason: &str) {
        tracing::warn!(
            state_index = ?self.round.state_index(),
            session_id = self.round.session_id(),
            reason,
            "round aborted"
        );
        self.metrics.rounds_aborted.inc();
        self.job = None;
        self.round = RoundState::default();
    }

    /// Handles the VM result for the current round.
    ///
    /// A failing or inconsistent execution aborts the round: every flag is
    /// reset and the next state transition starts over at the same index.
    pub fn on_execution_result(&mut self, now: Instant, outcome: ExecutionOutcome) -> Result<()> {
        let flags = self.round.flags();
        if outcome.session_id != self.round.session_id()
            || !flags.execution_started
            || flags.execution_done
        {
            tracing::debug!(session_id = outcome.session_id, "stale execution result ignored");
            return Ok(());
        }
        let output = match outcome.result {
            Ok(output) => output,
            Err(e) => {
                self.abort_round(&e.to_string());
                return Ok(());
            }
        };
        if let Err(e) = self.check_output(&output) {
            self.abort_round(&e.to_string());
            return Ok(());
        }

        let committee = self.ctx.committee.clone();
        let essence_hash = output.essence.hash();
        let next_state = Arc::new(output.next_state);
        self.ctx
            .candidates
            .register_candidate(output.block.clone(), next_state.clone());

        tracing::info!(
            state_index = next_state.index(),
            requests = output.block.updates().len(),
            essence = %essence_hash.short(),
            "batch executed"
        );
        self.round.executed = Some(ExecutedBatch {
            block: output.block,
            next_state,
            essence: output.essence,
            essence_hash,
        });
        self.round.signatures = Some(SignatureCollector::new(
            essence_hash,
            committee.size(),
            committee.quorum(),
        ));
        self.round.flags.execution_done = true;

        let own = self.own_index();
        let contributed = self.round.batch.as_ref().is_some_and(|b| b.has_contributor(own));
        if contributed {
            let signature = committee.sign(essence_hash.as_bytes());
            let signed = SignedResult {
                sender_index: own,
                state_index: self.round.state_index().unwrap_or_default(),
                session_id: self.round.session_id(),
                essence_hash,
                signature,
            };
            self.ctx.peers.broadcast_signed_result(&signed);
            if let Err(e) = self.accept_signature(now, own, signature) {
                let reason = format!("own signature rejected: {e}");
                committee.dismiss(&reason);
                return Err(ConsensusError::Dismissed(reason));
            }
        } else {
            tracing::debug!("not a contributor, not signing");
        }

        for early in std::mem::take(&mut self.round.early_signatures) {
            let sender = early.sender_index;
            if let Err(e) = self.on_signed_result(now, early) {
                tracing::warn!(sender, error = %e, "buffered signed result rejected");
            }
        }
        Ok(())
    }

    /// Handles a partial signature from another member.
    pub fn on_signed_result(&mut self, now: Instant, result: SignedResult) -> Result<()> {
        let size = self.ctx.committee.size();
        let sender = result.sender_index;
        if sender as usize >= size {
            self.metrics.signatures_rejected.inc();
            return Err(ConsensusError::SignerOutOfRange {
                index: sender,
                size,
            });
        }
        if sender == self.own_index() {
            return Ok(());
        }

        let flags = self.round.flags();
        if !flags.state_received || result.session_id != self.round.session_id() {
            if self
                .round
                .state_index()
                .map_or(true, |current| result.state_index >= current)
            {
                self.keep_for_later(result);
            }
            return Ok(());
        }
        if flags.signatures_collected {
            tracing::trace!(sender, "quorum complete, signed result ignored");
            return Ok(());
        }
        if !flags.execution_done {
            let early = &mut self.round.early_signatures;
            if !early.iter().any(|r| r.sender_index == sender) {
                early.push(result);
            }
            return Ok(());
        }

        let expected = self.round.executed.as_ref().map(|e| e.essence_hash);
        if expected != Some(result.essence_hash) {
            self.metrics.signatures_rejected.inc();
            return Err(ConsensusError::InvalidSignature(format!(
                "member {sender} signed essence {}",
                result.essence_hash.short()
            )));
        }
        self.accept_signature(now, sender, result.signature)
    }

    fn keep_for_later(&mut self, result: SignedResult) {
        let limit = self.ctx.committee.size() * 2;
        if self
            .backlog
            .iter()
            .any(|r| r.session_id == result.session_id && r.sender_index == result.sender_index)
        {
            return;
        }
        if self.backlog.len() >= limit {
            self.backlog.remove(0);
        }
        self.backlog.push(result);
    }

    fn accept_signature(
        &mut self,
        now: Instant,
        index: MemberIndex,
        signature: keel_types::Signature,
    ) -> Result<()> {
        let committee = self.ctx.committee.clone();
        let Some(collector) = self.round.signatures.as_mut() else {
            return Ok(());
        };
        match collector.add(&*committee, index, signature) {
            Ok(Collected::Added { count }) => {
                self.metrics.signatures_accepted.inc();
                tracing::debug!(sender = index, count, "signature accepted");
            }
            Ok(Collected::QuorumReached) => {
                self.metrics.signatures_accepted.inc();
                self.round.flags.signatures_collected = true;
                tracing::debug!(sender = index, "signature quorum reached");
                self.finalize_and_post(now)?;
            }
            Ok(Collected::Ignored) => {}
            Err(e) => {
                self.metrics.signatures_rejected.inc();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Builds the signed transaction from the collected quorum and posts it.
    pub fn finalize_and_post(&mut self, now: Instant) -> Result<()> {
        let flags = self.round.flags();
        if !flags.signatures_collected || flags.transaction_finalized {
            return Ok(());
        }
        let (Some(executed), Some(collector)) = (&self.round.executed, &self.round.signatures)
        else {
            return Ok(());
        };

        let transaction = SignedTransaction::new(executed.essence.clone(), collector.signatures());
        if let Err(e) = transaction.verify(&*self.ctx.committee) {
            let reason = format!("finalized transaction does not verify: {e}");
            self.ctx.committee.dismiss(&reason);
            return Err(ConsensusError::Dismissed(reason));
        }
        tracing::info!(
            tx = %transaction.id(),
            state_index = executed.essence.state_index,
            signatures = transaction.signatures.len(),
            "transaction finalized"
        );

        self.round.transaction = Some(transaction);
        self.round.flags.transaction_finalized = true;
        self.round.post_deadline = Some(now + self.config.post_deadline);
        self.round.inclusion_deadline = Some(now + self.config.inclusion_deadline);
        self.round.next_poll_at = Some(now + self.config.inclusion_poll_interval);
        self.post_transaction(now);
        Ok(())
    }

    fn post_transaction(&mut self, now: Instant) {
        let Some(transaction) = &self.round.transaction else {
            return;
        };
        self.ctx.node.post_transaction(transaction);
        tracing::debug!(tx = %transaction.id(), "transaction posted");
        self.metrics.transactions_posted.inc();
        self.round.flags.transaction_posted = true;
        self.round.next_post_at = Some(now + self.config.post_retry);
    }

    fn drive_inclusion(&mut self, now: Instant) {
        if self.round.inclusion_deadline.is_some_and(|d| now >= d) {
            self.abandon_round("inclusion deadline exceeded");
            return;
        }
        if self.round.post_deadline.is_some_and(|d| now < d)
            && self.round.next_post_at.is_some_and(|at| now >= at)
        {
            self.post_transaction(now);
        }
        if self.round.next_poll_at.is_some_and(|at| now >= at) {
            if let Some(transaction) = &self.round.transaction {
                self.ctx.node.pull_inclusion_state(&transaction.id());
                self.round.flags.inclusion_polled = true;
                self.round.next_poll_at = Some(now + self.config.inclusion_poll_interval);
            }
        }
    }

    fn abandon_round(&mut self, reason: &str) {
        tracing::warn!(
            state_index = ?self.round.state_index(),
            reason,
            "round abandoned, waiting for next anchor output"
        );
        self.metrics.rounds_abandoned.inc();
        self.round.flags.finished = true;
    }

    /// Handles the ledger's answer about a posted transaction.
    pub fn on_inclusion_state(&mut self, tx_id: TransactionId, state: InclusionState) {
        let Some(transaction) = &self.round.transaction else {
            return;
        };
        if transaction.id() != tx_id || self.round.flags().finished {
            return;
        }
        match state {
            InclusionState::Confirmed => {
                tracing::info!(tx = %tx_id, "transaction confirmed");
                self.round.flags.transaction_seen = true;
                self.round.flags.finished = true;
                self.metrics.rounds_completed.inc();
            }
            InclusionState::Rejected => self.abandon_round("transaction rejected"),
            InclusionState::Unknown => tracing::trace!(tx = %tx_id, "transaction not seen yet"),
        }
    }

    /// Current status.
    pub fn status_snapshot(&self) -> ConsensusStatus {
        let committee = &self.ctx.committee;
        ConsensusStatus {
            state_index: self.round.state_index(),
            phase: self.round.flags().phase(),
            session_id: self.round.session_id(),
            signatures: self.round.signature_count(),
            committee_size: committee.size(),
            quorum: committee.quorum(),
            ready: committee.is_ready(),
            timer_ticks: self.timer_ticks,
            mempool: self.ctx.mempool.stats(),
        }
    }
}
