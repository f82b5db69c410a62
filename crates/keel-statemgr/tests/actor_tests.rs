//! State manager actor behaviour.

use keel_state::{Block, Mutation, StateUpdate, VirtualState};
use keel_statemgr::{
    Actor, OutputFetcher, PeerNetwork, StateManager, StateManagerConfig, StateManagerContext,
    StateManagerMetrics, StateTransition, TransitionSink,
};
use keel_storage::MemoryStore;
use keel_types::{
    ChainAddress, HashValue, MemberIndex, OutputId, RequestId, SigningKey, StateOutput,
    StaticCommittee, TransactionId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Channels {
    transitions: mpsc::UnboundedSender<StateTransition>,
    pulls: mpsc::UnboundedSender<()>,
}

impl PeerNetwork for Channels {
    fn request_block(&self, _peer: MemberIndex, _state_index: u32) {}
    fn send_block(&self, _peer: MemberIndex, _block: &Block) {}
}

impl OutputFetcher for Channels {
    fn pull_state(&self, _chain: &ChainAddress) {
        let _ = self.pulls.send(());
    }
    fn pull_confirmed_output(&self, _chain: &ChainAddress, _output_id: &OutputId) {}
}

impl TransitionSink for Channels {
    fn on_state_transition(&self, transition: StateTransition) {
        let _ = self.transitions.send(transition);
    }
}

fn committee() -> Arc<StaticCommittee> {
    let key = SigningKey::from([21u8; 32]);
    Arc::new(StaticCommittee::new(vec![key.verification_key()], 0, key, None).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_actor_waits_for_readiness_then_advances() {
    let chain = ChainAddress::from_seed("actor");
    let committee = committee();
    committee.set_ready(false);

    let (tx_transitions, mut transitions) = mpsc::unbounded_channel();
    let (tx_pulls, mut pulls) = mpsc::unbounded_channel();
    let channels = Arc::new(Channels {
        transitions: tx_transitions,
        pulls: tx_pulls,
    });
    let ctx = StateManagerContext {
        committee: committee.clone(),
        store: Arc::new(MemoryStore::new()),
        peers: channels.clone(),
        fetcher: channels.clone(),
        sink: channels,
    };
    let config = StateManagerConfig::default();
    let manager =
        StateManager::bootstrap(chain, ctx, config.clone(), StateManagerMetrics::default())
            .unwrap();
    let origin = manager.solid_state().clone();
    let (actor, mailbox) = Actor::new(manager, committee.clone(), &config);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(actor.run(cancel.clone()));

    // Not ready: no ledger pulls yet.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(pulls.try_recv().is_err());

    committee.set_ready(true);
    pulls.recv().await.unwrap();

    let origin_output = StateOutput::new(
        OutputId::new(TransactionId(HashValue::digest(b"origin")), 0),
        0,
        origin.hash(),
        0,
    );
    mailbox.deliver_output(origin_output.clone());
    let first = transitions.recv().await.unwrap();
    assert_eq!(first.output, origin_output);

    // A local candidate, then its confirmation.
    let req = RequestId::new(TransactionId(HashValue::digest(b"req")), 1);
    let block = Block::new(1, 5, vec![StateUpdate::for_request(req, 5, vec![Mutation::set("a", "1")])]).unwrap();
    let next: Arc<VirtualState> = Arc::new(origin.apply_block(&block).unwrap());
    mailbox.register_candidate(block, next.clone());
    mailbox.deliver_output(StateOutput::new(
        OutputId::new(TransactionId(HashValue::digest(b"tx1")), 0),
        1,
        next.hash(),
        5,
    ));

    let second = transitions.recv().await.unwrap();
    assert_eq!(second.solid_state.index(), 1);
    assert_eq!(second.processed, vec![req]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = mailbox.status();
    assert_eq!(status.solid_index, 1);
    assert!(status.validated);
    assert!(status.synced);

    cancel.cancel();
    handle.await.unwrap();

    // Sends after shutdown are dropped without blocking.
    mailbox.get_block(0, 1);
}

#[tokio::test(start_paused = true)]
async fn test_actor_stops_when_dismissed() {
    let committee = committee();
    let (tx_transitions, _transitions) = mpsc::unbounded_channel();
    let (tx_pulls, _pulls) = mpsc::unbounded_channel();
    let channels = Arc::new(Channels {
        transitions: tx_transitions,
        pulls: tx_pulls,
    });
    let ctx = StateManagerContext {
        committee: committee.clone(),
        store: Arc::new(MemoryStore::new()),
        peers: channels.clone(),
        fetcher: channels.clone(),
        sink: channels,
    };
    let config = StateManagerConfig::default();
    let manager = StateManager::bootstrap(
        ChainAddress::from_seed("dismiss"),
        ctx,
        config.clone(),
        StateManagerMetrics::default(),
    )
    .unwrap();
    let (actor, mailbox) = Actor::new(manager, committee.clone(), &config);
    let handle = tokio::spawn(actor.run(CancellationToken::new()));

    // An output contradicting the unvalidated origin state is fatal.
    mailbox.deliver_output(StateOutput::new(OutputId::default(), 0, HashValue::digest(b"bad"), 0));
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("actor should stop")
        .unwrap();
    assert!(keel_types::Committee::is_dismissed(&*committee));
}
