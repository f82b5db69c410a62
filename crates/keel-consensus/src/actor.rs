//! Consensus actor.
//!
//! Owns the [`Consensus`] engine and serializes every event through one
//! mailbox. Batch execution runs on the blocking pool and reports back
//! through the same mailbox, so the loop itself never waits on the VM.

use crate::engine::{Consensus, ConsensusStatus, ExecutionOutcome};
use crate::ports::{InclusionState, VmError};
use crate::round::BatchProposal;
use keel_p2p::SignedResult;
use keel_statemgr::{StateTransition, TransitionSink};
use keel_types::{Committee, TransactionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How often readiness is polled before the loop starts.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events consumed by the consensus engine.
#[derive(Debug)]
pub enum Message {
    /// New solid state from the state manager.
    StateTransition(StateTransition),
    /// Proposals agreed by the committee.
    AgreementResult {
        /// Round session.
        session_id: u64,
        /// Agreed proposals.
        proposals: Vec<BatchProposal>,
    },
    /// VM result.
    ExecutionResult(ExecutionOutcome),
    /// Partial signature from a peer.
    SignedResult(SignedResult),
    /// Ledger inclusion state of a posted transaction.
    InclusionState {
        /// Posted transaction.
        tx_id: TransactionId,
        /// Its state.
        state: InclusionState,
    },
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::StateTransition(_) => "state_transition",
            Message::AgreementResult { .. } => "agreement_result",
            Message::ExecutionResult(_) => "execution_result",
            Message::SignedResult(_) => "signed_result",
            Message::InclusionState { .. } => "inclusion_state",
        }
    }
}

/// Handle for sending events to the consensus engine.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    status: watch::Receiver<ConsensusStatus>,
}

/// Receiving side of a [`Mailbox`], consumed by [`Actor::new`].
pub struct Inbox {
    receiver: mpsc::Receiver<Message>,
    status: watch::Sender<ConsensusStatus>,
}

/// Creates a mailbox before the engine exists, so the state manager can be
/// wired to it first.
pub fn channel(size: usize) -> (Mailbox, Inbox) {
    let (sender, receiver) = mpsc::channel(size);
    let (status, status_rx) = watch::channel(ConsensusStatus::default());
    (
        Mailbox {
            sender,
            status: status_rx,
        },
        Inbox { receiver, status },
    )
}

impl Mailbox {
    fn send(&self, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.sender.try_send(msg) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(kind, "consensus mailbox full, dropping message")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(kind, "consensus stopped, dropping message")
                }
            }
        }
    }

    /// Delivers the agreed proposals of a session.
    pub fn agreement_result(&self, session_id: u64, proposals: Vec<BatchProposal>) {
        self.send(Message::AgreementResult {
            session_id,
            proposals,
        });
    }

    /// Delivers a peer's partial signature.
    pub fn signed_result(&self, result: SignedResult) {
        self.send(Message::SignedResult(result));
    }

    /// Delivers the inclusion state of a posted transaction.
    pub fn inclusion_state(&self, tx_id: TransactionId, state: InclusionState) {
        self.send(Message::InclusionState { tx_id, state });
    }

    /// Latest published status.
    pub fn status(&self) -> ConsensusStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status updates.
    pub fn subscribe(&self) -> watch::Receiver<ConsensusStatus> {
        self.status.clone()
    }
}

impl TransitionSink for Mailbox {
    fn on_state_transition(&self, transition: StateTransition) {
        self.send(Message::StateTransition(transition));
    }
}

/// The consensus event loop.
pub struct Actor {
    engine: Consensus,
    committee: Arc<dyn Committee>,
    timer_tick: Duration,
    mailbox: Mailbox,
    inbox: Inbox,
}

impl Actor {
    /// Creates the actor. `mailbox` and `inbox` come from one [`channel`].
    pub fn new(
        engine: Consensus,
        committee: Arc<dyn Committee>,
        timer_tick: Duration,
        mailbox: Mailbox,
        inbox: Inbox,
    ) -> Self {
        Self {
            engine,
            committee,
            timer_tick,
            mailbox,
            inbox,
        }
    }

    fn handle(&mut self, msg: Message) {
        let kind = msg.kind();
        let now = Instant::now();
        let result = match msg {
            Message::StateTransition(transition) => {
                self.engine.on_state_transition(now, transition);
                Ok(())
            }
            Message::AgreementResult {
                session_id,
                proposals,
            } => self.engine.on_agreement_result(now, session_id, proposals),
            Message::ExecutionResult(outcome) => self.engine.on_execution_result(now, outcome),
            Message::SignedResult(result) => self.engine.on_signed_result(now, result),
            Message::InclusionState { tx_id, state } => {
                self.engine.on_inclusion_state(tx_id, state);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(kind, error = %e, "consensus event failed");
        }
    }

    fn spawn_execution(&mut self) {
        let Some(job) = self.engine.take_execution_job() else {
            return;
        };
        let session_id = job.session_id();
        let sender = self.mailbox.sender.clone();
        tokio::spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(outcome) => outcome,
                Err(e) => ExecutionOutcome {
                    session_id,
                    result: Err(VmError(format!("execution task failed: {e}"))),
                },
            };
            if sender.send(Message::ExecutionResult(outcome)).await.is_err() {
                tracing::debug!(session_id, "consensus stopped before execution finished");
            }
        });
    }

    fn publish_status(&self) {
        let next = self.engine.status_snapshot();
        self.inbox.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Runs the event loop until cancelled or the committee is dismissed.
    pub async fn run(mut self, cancel: CancellationToken) {
        while !self.committee.is_ready() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
        tracing::info!(chain = %self.engine.chain(), "consensus started");

        let mut ticker = tokio::time::interval(self.timer_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                msg = self.inbox.receiver.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },

                _ = ticker.tick() => self.engine.on_timer_tick(Instant::now()),
            }

            if self.committee.is_dismissed() {
                tracing::warn!("committee dismissed, consensus stopping");
                break;
            }
            self.spawn_execution();
            self.publish_status();
        }
        tracing::info!(chain = %self.engine.chain(), "consensus stopped");
    }
}
