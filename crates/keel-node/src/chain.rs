//! Chain instance wiring.
//!
//! A chain instance is one committee member's view of one chain: a state
//! manager actor and a consensus actor, connected to each other and to the
//! outside world through the ports in [`ChainPorts`].

use crate::error::Result;
use crate::observability::NodeMetrics;
use keel_consensus::{
    Agreement, BatchProposal, Consensus, ConsensusConfig, ConsensusContext, ConsensusMetrics,
    ConsensusStatus, InclusionState, Mempool, NodeConnection, ResultBroadcast, VmRunner,
};
use keel_p2p::SignedResult;
use keel_state::Block;
use keel_statemgr::{
    OutputFetcher, PeerNetwork, StateManager, StateManagerConfig, StateManagerContext,
    StateManagerMetrics, StateManagerStatus,
};
use keel_storage::ChainStore;
use keel_types::{ChainAddress, Committee, MemberIndex, StateOutput, TransactionId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External collaborators of a chain instance.
#[derive(Clone)]
pub struct ChainPorts {
    /// Persistent store.
    pub store: Arc<dyn ChainStore>,
    /// Pending requests.
    pub mempool: Arc<dyn Mempool>,
    /// Batch executor.
    pub vm: Arc<dyn VmRunner>,
    /// Agreement primitive.
    pub agreement: Arc<dyn Agreement>,
    /// Ledger connection for posting and inclusion polls.
    pub node: Arc<dyn NodeConnection>,
    /// Ledger connection for anchor output pulls.
    pub fetcher: Arc<dyn OutputFetcher>,
    /// Block exchange with peers.
    pub peers: Arc<dyn PeerNetwork>,
    /// Partial signature exchange with peers.
    pub broadcast: Arc<dyn ResultBroadcast>,
}

/// Inbound side of a running chain instance.
///
/// Cheap to clone; every method is fire-and-forget.
#[derive(Clone)]
pub struct ChainHandle {
    own_index: MemberIndex,
    state: keel_statemgr::Mailbox,
    consensus: keel_consensus::Mailbox,
}

impl ChainHandle {
    /// Member this handle delivers to.
    pub fn own_index(&self) -> MemberIndex {
        self.own_index
    }

    /// Delivers an anchor output observed on the ledger.
    pub fn deliver_output(&self, output: StateOutput) {
        self.state.deliver_output(output);
    }

    /// Delivers the inclusion state of a posted transaction.
    pub fn deliver_inclusion_state(&self, tx_id: TransactionId, state: InclusionState) {
        self.consensus.inclusion_state(tx_id, state);
    }

    /// Delivers a block sent by a peer.
    pub fn deliver_block(&self, sender: MemberIndex, block: Block) {
        self.state.block_from_peer(sender, block);
    }

    /// Delivers a peer's block request.
    pub fn deliver_get_block(&self, sender: MemberIndex, state_index: u32) {
        self.state.get_block(sender, state_index);
    }

    /// Delivers a peer's partial signature.
    pub fn deliver_signed_result(&self, result: SignedResult) {
        self.consensus.signed_result(result);
    }

    /// Delivers the agreed proposals of a round.
    pub fn deliver_agreement(&self, session_id: u64, proposals: Vec<BatchProposal>) {
        self.consensus.agreement_result(session_id, proposals);
    }

    /// Latest consensus status.
    pub fn consensus_status(&self) -> ConsensusStatus {
        self.consensus.status()
    }

    /// Latest state manager status.
    pub fn state_status(&self) -> StateManagerStatus {
        self.state.status()
    }
}

/// A running chain instance.
pub struct ChainInstance {
    chain: ChainAddress,
    committee: Arc<dyn Committee>,
    handle: ChainHandle,
    metrics: NodeMetrics,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChainInstance {
    /// Bootstraps the chain state and starts both actors.
    ///
    /// If the stored state cannot be loaded the committee is dismissed and no
    /// actor is started. Must be called from within a Tokio runtime.
    pub fn start(
        chain: ChainAddress,
        committee: Arc<dyn Committee>,
        ports: ChainPorts,
        consensus_config: ConsensusConfig,
        state_config: StateManagerConfig,
        metrics: &NodeMetrics,
    ) -> Result<Self> {
        let own_index = committee.own_index();
        let (consensus_mailbox, inbox) = keel_consensus::channel(consensus_config.mailbox_size);

        let state_metrics = StateManagerMetrics::default();
        let consensus_metrics = ConsensusMetrics::default();

        let state_ctx = StateManagerContext {
            committee: committee.clone(),
            store: ports.store,
            peers: ports.peers,
            fetcher: ports.fetcher,
            sink: Arc::new(consensus_mailbox.clone()),
        };
        let manager = match StateManager::bootstrap(
            chain,
            state_ctx,
            state_config.clone(),
            state_metrics.clone(),
        ) {
            Ok(manager) => manager,
            Err(e) => {
                metrics.bootstrap_failures.inc();
                tracing::error!(chain = %chain, member = own_index, error = %e, "chain instance not started");
                return Err(e.into());
            }
        };
        let (state_actor, state_mailbox) =
            keel_statemgr::Actor::new(manager, committee.clone(), &state_config);

        let consensus_ctx = ConsensusContext {
            committee: committee.clone(),
            mempool: ports.mempool,
            vm: ports.vm,
            agreement: ports.agreement,
            node: ports.node,
            peers: ports.broadcast,
            candidates: Arc::new(state_mailbox.clone()),
        };
        let timer_tick = consensus_config.timer_tick;
        let engine = Consensus::new(chain, consensus_ctx, consensus_config, consensus_metrics.clone());
        let consensus_actor = keel_consensus::Actor::new(
            engine,
            committee.clone(),
            timer_tick,
            consensus_mailbox.clone(),
            inbox,
        );

        metrics.register_chain(own_index, &consensus_metrics, &state_metrics);

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(state_actor.run(cancel.child_token())),
            tokio::spawn(consensus_actor.run(cancel.child_token())),
        ];
        metrics.chains_started.inc();
        metrics.chains_running.inc();
        tracing::info!(chain = %chain, member = own_index, "chain instance started");

        Ok(Self {
            chain,
            committee,
            handle: ChainHandle {
                own_index,
                state: state_mailbox,
                consensus: consensus_mailbox,
            },
            metrics: metrics.clone(),
            cancel,
            tasks,
        })
    }

    /// Chain served by this instance.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// Inbound handle.
    pub fn handle(&self) -> ChainHandle {
        self.handle.clone()
    }

    /// Delivers an anchor output observed on the ledger.
    pub fn deliver_output(&self, output: StateOutput) {
        self.handle.deliver_output(output);
    }

    /// Delivers the inclusion state of a posted transaction.
    pub fn deliver_inclusion_state(&self, tx_id: TransactionId, state: InclusionState) {
        self.handle.deliver_inclusion_state(tx_id, state);
    }

    /// Whether the committee dismissed this instance.
    pub fn is_dismissed(&self) -> bool {
        self.committee.is_dismissed()
    }

    /// Stops both actors and waits for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(chain = %self.chain, error = %e, "chain actor task failed");
            }
        }
        self.metrics.chains_running.dec();
        tracing::info!(chain = %self.chain, member = self.handle.own_index, "chain instance stopped");
    }
}
