//! Synchronization of a lagging node against peers and the ledger.

use keel_state::{Block, Mutation, StateUpdate, VirtualState};
use keel_statemgr::{
    peer_permutation, OutputFetcher, PeerNetwork, StateManager, StateManagerConfig,
    StateManagerContext, StateManagerMetrics, StateTransition, TransitionSink,
};
use keel_storage::{ChainStore, MemoryStore};
use keel_types::{
    ChainAddress, Committee, HashValue, MemberIndex, OutputId, RequestId, SigningKey,
    StateOutput, StaticCommittee, TransactionId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Harness {
    requests: Mutex<Vec<(MemberIndex, u32)>>,
    confirmed_pulls: Mutex<Vec<OutputId>>,
    transitions: Mutex<Vec<StateTransition>>,
}

impl PeerNetwork for Harness {
    fn request_block(&self, peer: MemberIndex, state_index: u32) {
        self.requests.lock().push((peer, state_index));
    }
    fn send_block(&self, _peer: MemberIndex, _block: &Block) {}
}

impl OutputFetcher for Harness {
    fn pull_state(&self, _chain: &ChainAddress) {}
    fn pull_confirmed_output(&self, _chain: &ChainAddress, output_id: &OutputId) {
        self.confirmed_pulls.lock().push(*output_id);
    }
}

impl TransitionSink for Harness {
    fn on_state_transition(&self, transition: StateTransition) {
        self.transitions.lock().push(transition);
    }
}

/// The chain as the rest of the committee already knows it.
struct History {
    origin: VirtualState,
    blocks: Vec<Block>,
    outputs: Vec<StateOutput>,
    states: Vec<VirtualState>,
}

fn history(chain: ChainAddress, len: u32) -> History {
    let origin = VirtualState::origin(chain);
    let mut state = origin.clone();
    let mut blocks = Vec::new();
    let mut outputs = Vec::new();
    let mut states = Vec::new();
    for index in 1..=len {
        let req = RequestId::new(TransactionId(HashValue::digest(&index.to_be_bytes())), 0);
        let mut block = Block::new(
            index,
            index as u64 * 1_000,
            vec![StateUpdate::for_request(req, 0, vec![Mutation::set(format!("k{index}"), "v")])],
        )
        .unwrap();
        state = state.apply_block(&block).unwrap();
        let output = StateOutput::new(
            OutputId::new(TransactionId(HashValue::digest(format!("anchor{index}").as_bytes())), 0),
            index,
            state.hash(),
            index as u64 * 1_000,
        );
        block.set_approving_output_id(output.id);
        blocks.push(block);
        outputs.push(output);
        states.push(state.clone());
    }
    History {
        origin,
        blocks,
        outputs,
        states,
    }
}

fn committee() -> Arc<StaticCommittee> {
    let keys: Vec<SigningKey> = (0..5).map(|i| SigningKey::from([i as u8 + 11; 32])).collect();
    let members = keys.iter().map(|k| k.verification_key()).collect();
    Arc::new(StaticCommittee::new(members, 0, keys[0].clone(), None).unwrap())
}

#[test]
fn test_lagging_node_syncs_strictly_in_order() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let chain = ChainAddress::from_seed("sync");
    let hist = history(chain, 3);
    let committee = committee();
    let harness = Arc::new(Harness::default());
    let store = Arc::new(MemoryStore::new());
    let config = StateManagerConfig {
        sync_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let ctx = StateManagerContext {
        committee: committee.clone(),
        store: store.clone(),
        peers: harness.clone(),
        fetcher: harness.clone(),
        sink: harness.clone(),
    };
    let mut mgr =
        StateManager::bootstrap(chain, ctx, config, StateManagerMetrics::default()).unwrap();

    // The ledger reports index 3 while we are at the origin.
    mgr.on_state_output(hist.outputs[2].clone()).unwrap();
    assert!(!mgr.is_synced());
    assert!(harness.transitions.lock().is_empty());

    let peers = committee.peers();
    let mut now = Instant::now();
    let mut solid_indices = vec![mgr.solid_state().index()];

    for (i, block) in hist.blocks.iter().enumerate() {
        let wanted = i as u32 + 1;
        let expected_order = peer_permutation(&peers, &mgr.solid_state().hash());

        mgr.on_timer(now);
        let (first_peer, index) = *harness.requests.lock().last().unwrap();
        assert_eq!(index, wanted);
        assert_eq!(first_peer, expected_order[0]);

        // The first peer stays silent; after the timeout the next one is asked.
        now += Duration::from_millis(500);
        mgr.on_timer(now);
        let (second_peer, index) = *harness.requests.lock().last().unwrap();
        assert_eq!(index, wanted);
        assert_eq!(second_peer, expected_order[1]);

        mgr.on_block_from_peer(second_peer, block.clone()).unwrap();
        if wanted < 3 {
            assert_eq!(
                harness.confirmed_pulls.lock().last().copied(),
                Some(hist.outputs[i].id)
            );
            mgr.on_state_output(hist.outputs[i].clone()).unwrap();
        }
        solid_indices.push(mgr.solid_state().index());
    }

    assert_eq!(solid_indices, vec![0, 1, 2, 3]);
    assert_eq!(mgr.solid_state().hash(), hist.states[2].hash());
    assert!(mgr.is_synced());

    // Only the final state, matching the latest anchor output, is announced.
    let transitions = harness.transitions.lock();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].output.id, hist.outputs[2].id);
    assert_eq!(transitions[0].processed.len(), 3);

    for index in 1..=3 {
        assert!(store.load_block(&chain, index).unwrap().is_some());
    }
    assert_eq!(hist.origin.index(), 0);
}

#[test]
fn test_out_of_order_blocks_wait_for_predecessor() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let chain = ChainAddress::from_seed("sync");
    let hist = history(chain, 2);
    let harness = Arc::new(Harness::default());
    let ctx = StateManagerContext {
        committee: committee(),
        store: Arc::new(MemoryStore::new()),
        peers: harness.clone(),
        fetcher: harness.clone(),
        sink: harness.clone(),
    };
    let mut mgr = StateManager::bootstrap(
        chain,
        ctx,
        StateManagerConfig::default(),
        StateManagerMetrics::default(),
    )
    .unwrap();

    mgr.on_state_output(hist.outputs[1].clone()).unwrap();
    mgr.on_block_from_peer(1, hist.blocks[1].clone()).unwrap();
    assert_eq!(mgr.solid_state().index(), 0);

    mgr.on_block_from_peer(2, hist.blocks[0].clone()).unwrap();
    assert_eq!(mgr.solid_state().index(), 0);
    mgr.on_state_output(hist.outputs[0].clone()).unwrap();

    assert_eq!(mgr.solid_state().index(), 2);
    assert_eq!(harness.transitions.lock().len(), 1);
}
