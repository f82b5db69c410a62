//! State manager actor.
//!
//! Wraps a [`StateManager`] in a single-consumer event loop. Other components
//! talk to it through a cloneable [`Mailbox`]; sends never block and are
//! dropped with a warning when the queue is full or the actor has stopped.

use crate::manager::{StateManager, StateManagerStatus};
use crate::StateManagerConfig;
use keel_state::{Block, VirtualState};
use keel_types::{Committee, MemberIndex, StateOutput};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How often readiness is polled before the loop starts.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events consumed by the state manager.
#[derive(Debug)]
pub enum Message {
    /// Anchor output from the ledger.
    StateOutput(StateOutput),
    /// Block relayed by a peer.
    BlockFromPeer {
        /// Sending member.
        sender: MemberIndex,
        /// The block.
        block: Block,
    },
    /// A peer asks for a block.
    GetBlock {
        /// Requesting member.
        sender: MemberIndex,
        /// Requested state index.
        state_index: u32,
    },
    /// Block computed by the local consensus round.
    Candidate {
        /// The block.
        block: Block,
        /// The state it produces.
        next_state: Arc<VirtualState>,
    },
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::StateOutput(_) => "state_output",
            Message::BlockFromPeer { .. } => "block_from_peer",
            Message::GetBlock { .. } => "get_block",
            Message::Candidate { .. } => "candidate",
        }
    }
}

/// Handle for sending events to the state manager.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    status: watch::Receiver<StateManagerStatus>,
}

impl Mailbox {
    fn send(&self, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.sender.try_send(msg) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(kind, "state manager mailbox full, dropping message")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(kind, "state manager stopped, dropping message")
                }
            }
        }
    }

    /// Delivers an anchor output.
    pub fn deliver_output(&self, output: StateOutput) {
        self.send(Message::StateOutput(output));
    }

    /// Delivers a block received from a peer.
    pub fn block_from_peer(&self, sender: MemberIndex, block: Block) {
        self.send(Message::BlockFromPeer { sender, block });
    }

    /// Delivers a peer's block request.
    pub fn get_block(&self, sender: MemberIndex, state_index: u32) {
        self.send(Message::GetBlock {
            sender,
            state_index,
        });
    }

    /// Registers a locally computed candidate.
    pub fn register_candidate(&self, block: Block, next_state: Arc<VirtualState>) {
        self.send(Message::Candidate { block, next_state });
    }

    /// Latest published status.
    pub fn status(&self) -> StateManagerStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status updates.
    pub fn subscribe(&self) -> watch::Receiver<StateManagerStatus> {
        self.status.clone()
    }
}

/// The state manager event loop.
pub struct Actor {
    manager: StateManager,
    committee: Arc<dyn Committee>,
    timer_tick: Duration,
    mailbox: mpsc::Receiver<Message>,
    status: watch::Sender<StateManagerStatus>,
}

impl Actor {
    /// Creates a new actor around a bootstrapped manager.
    pub fn new(
        manager: StateManager,
        committee: Arc<dyn Committee>,
        config: &StateManagerConfig,
    ) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let (status, status_rx) = watch::channel(manager.status());
        (
            Self {
                manager,
                committee,
                timer_tick: config.timer_tick,
                mailbox,
                status,
            },
            Mailbox {
                sender,
                status: status_rx,
            },
        )
    }

    fn handle(&mut self, msg: Message) {
        let kind = msg.kind();
        let result = match msg {
            Message::StateOutput(output) => self.manager.on_state_output(output),
            Message::BlockFromPeer { sender, block } => self.manager.on_block_from_peer(sender, block),
            Message::GetBlock {
                sender,
                state_index,
            } => {
                self.manager.on_get_block(sender, state_index);
                Ok(())
            }
            Message::Candidate { block, next_state } => self
                .manager
                .register_candidate(block, Some(next_state))
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(kind, error = %e, "state manager event failed");
        }
    }

    /// Runs the event loop until cancelled or the committee is dismissed.
    pub async fn run(mut self, cancel: CancellationToken) {
        while !self.committee.is_ready() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
        tracing::info!(
            chain = %self.manager.chain(),
            solid_index = self.manager.solid_state().index(),
            "state manager started"
        );

        let mut ticker = tokio::time::interval(self.timer_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                msg = self.mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },

                _ = ticker.tick() => self.manager.on_timer(Instant::now()),
            }

            if self.committee.is_dismissed() {
                tracing::warn!("committee dismissed, state manager stopping");
                break;
            }
            self.status.send_if_modified(|current| {
                let next = self.manager.status();
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
        }
        tracing::info!(chain = %self.manager.chain(), "state manager stopped");
    }
}
