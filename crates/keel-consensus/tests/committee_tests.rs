//! A full round across a four member committee, routed by hand.

use keel_consensus::{
    Agreement, BatchProposal, CandidateSink, Consensus, ConsensusConfig, ConsensusContext,
    ConsensusMetrics, NodeConnection, RequestPool, RequestResult, ResultBroadcast,
    RoundPhase, VmError, VmOutput, VmRunner, VmTask,
};
use keel_p2p::SignedResult;
use keel_state::{Block, Mutation, StateUpdate, VirtualState};
use keel_statemgr::StateTransition;
use keel_types::{
    ChainAddress, HashValue, OutputId, Request, RequestId, SignedTransaction, SigningKey,
    StateOutput, StaticCommittee, TransactionId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Outbox {
    proposals: Mutex<Vec<(u64, BatchProposal)>>,
    signed: Mutex<Vec<SignedResult>>,
    posted: Mutex<Vec<SignedTransaction>>,
    candidates: Mutex<Vec<Block>>,
}

impl Agreement for Outbox {
    fn propose(&self, session_id: u64, proposal: BatchProposal) {
        self.proposals.lock().push((session_id, proposal));
    }
}

impl ResultBroadcast for Outbox {
    fn broadcast_signed_result(&self, result: &SignedResult) {
        self.signed.lock().push(result.clone());
    }
}

impl NodeConnection for Outbox {
    fn post_transaction(&self, transaction: &SignedTransaction) {
        self.posted.lock().push(transaction.clone());
    }
    fn pull_inclusion_state(&self, _tx_id: &TransactionId) {}
}

impl CandidateSink for Outbox {
    fn register_candidate(&self, block: Block, _next_state: Arc<VirtualState>) {
        self.candidates.lock().push(block);
    }
}

/// Stores each request's payload under its id; mixes the entropy into one key.
struct KvVm;

impl VmRunner for KvVm {
    fn run(&self, task: VmTask) -> Result<VmOutput, VmError> {
        let mut updates: Vec<StateUpdate> = task
            .requests
            .iter()
            .map(|r| {
                StateUpdate::for_request(
                    r.id,
                    task.timestamp_ms,
                    vec![Mutation::set(r.id.to_bytes().to_vec(), r.payload.clone())],
                )
            })
            .collect();
        updates.push(StateUpdate {
            request_id: None,
            timestamp_ms: task.timestamp_ms,
            mutations: vec![Mutation::set("entropy", task.entropy.as_bytes().to_vec())],
        });
        let block = Block::new(task.state.index() + 1, task.timestamp_ms, updates)
            .map_err(|e| VmError(e.to_string()))?;
        let next_state = task
            .state
            .apply_block(&block)
            .map_err(|e| VmError(e.to_string()))?;
        let essence = task.essence_for(&block, &next_state);
        let results = task
            .requests
            .iter()
            .map(|r| RequestResult {
                request_id: r.id,
                error: None,
            })
            .collect();
        Ok(VmOutput {
            block,
            next_state,
            essence,
            results,
        })
    }
}

struct Node {
    engine: Consensus,
    outbox: Arc<Outbox>,
    pool: Arc<RequestPool>,
}

fn committee(n: usize) -> Vec<Node> {
    let keys: Vec<SigningKey> = (0..n).map(|i| SigningKey::from([i as u8 + 70; 32])).collect();
    let members: Vec<_> = keys.iter().map(|k| k.verification_key()).collect();
    let chain = ChainAddress::from_seed("committee");
    (0..n)
        .map(|i| {
            let committee = Arc::new(
                StaticCommittee::new(members.clone(), i as u16, keys[i].clone(), None).unwrap(),
            );
            let outbox = Arc::new(Outbox::default());
            let pool = Arc::new(RequestPool::with_defaults());
            let ctx = ConsensusContext {
                committee,
                mempool: pool.clone(),
                vm: Arc::new(KvVm),
                agreement: outbox.clone(),
                node: outbox.clone(),
                peers: outbox.clone(),
                candidates: outbox.clone(),
            };
            let config = ConsensusConfig {
                proposal_delay: Duration::ZERO,
                ..Default::default()
            };
            Node {
                engine: Consensus::new(chain, ctx, config, ConsensusMetrics::default()),
                outbox,
                pool,
            }
        })
        .collect()
}

fn request(n: u8) -> Request {
    Request::new(
        RequestId::new(TransactionId(HashValue::digest(b"requests")), n as u16),
        vec![n; 4],
        1_000 + n as u64,
    )
}

#[test]
fn test_committee_round_produces_one_transaction() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut nodes = committee(4);
    let chain = nodes[0].engine.chain();
    let origin = Arc::new(VirtualState::origin(chain));
    let output = StateOutput::new(
        OutputId::new(TransactionId(HashValue::digest(b"genesis")), 0),
        0,
        origin.hash(),
        0,
    );
    let requests: Vec<Request> = (1..=3).map(request).collect();
    for node in &nodes {
        for r in &requests {
            node.pool.add(r.clone()).unwrap();
        }
    }

    let now = Instant::now();
    for node in nodes.iter_mut() {
        node.engine.on_state_transition(
            now,
            StateTransition {
                solid_state: origin.clone(),
                output: output.clone(),
                processed: Vec::new(),
            },
        );
        node.engine.on_timer_tick(now);
    }

    // The agreement delivers the first quorum of proposals; member 3 is left out.
    let mut agreed: Vec<(u64, BatchProposal)> = nodes
        .iter()
        .map(|n| n.outbox.proposals.lock()[0].clone())
        .collect();
    agreed.truncate(3);
    let session = agreed[0].0;
    assert!(agreed.iter().all(|(s, _)| *s == session));
    let proposals: Vec<BatchProposal> = agreed.into_iter().map(|(_, p)| p).collect();

    for node in nodes.iter_mut() {
        node.engine
            .on_agreement_result(now, session, proposals.clone())
            .unwrap();
        let job = node.engine.take_execution_job().unwrap();
        node.engine.on_execution_result(now, job.run()).unwrap();
    }

    // Every node built the same block with exactly the three requests.
    let blocks: Vec<Block> = nodes
        .iter()
        .map(|n| n.outbox.candidates.lock()[0].clone())
        .collect();
    assert!(blocks.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(blocks[0].index(), 1);
    let mut ids: Vec<RequestId> = blocks[0].request_ids().collect();
    ids.sort();
    assert_eq!(ids, requests.iter().map(|r| r.id).collect::<Vec<_>>());

    // Only contributors signed.
    let signed: Vec<SignedResult> = nodes
        .iter()
        .flat_map(|n| n.outbox.signed.lock().clone())
        .collect();
    assert_eq!(signed.len(), 3);
    assert!(signed.iter().all(|s| s.sender_index != 3));

    for result in &signed {
        for (i, node) in nodes.iter_mut().enumerate() {
            if i as u16 != result.sender_index {
                node.engine.on_signed_result(now, result.clone()).unwrap();
            }
        }
    }

    let posted: Vec<SignedTransaction> = nodes
        .iter()
        .map(|n| {
            let posted = n.outbox.posted.lock();
            assert_eq!(posted.len(), 1);
            posted[0].clone()
        })
        .collect();
    assert!(posted.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(posted[0].essence.state_index, 1);
    assert_eq!(posted[0].essence.requests.len(), 3);
    assert_eq!(posted[0].signatures.len(), 3);

    for node in &nodes {
        let status = node.engine.status_snapshot();
        assert_eq!(status.phase, RoundPhase::Posted);
        assert_eq!(status.signatures, 3);
        assert_eq!(status.mempool.request_count, 3);
    }
}

#[test]
fn test_next_transition_clears_processed_requests() {
    let mut nodes = committee(1);
    let node = &mut nodes[0];
    let chain = node.engine.chain();
    for n in 1..=2 {
        node.pool.add(request(n)).unwrap();
    }
    let origin = Arc::new(VirtualState::origin(chain));
    let output = StateOutput::new(OutputId::default(), 0, origin.hash(), 0);
    let now = Instant::now();
    node.engine.on_state_transition(
        now,
        StateTransition {
            solid_state: origin.clone(),
            output,
            processed: Vec::new(),
        },
    );
    node.engine.on_timer_tick(now);
    let (session, proposal) = node.outbox.proposals.lock()[0].clone();
    node.engine
        .on_agreement_result(now, session, vec![proposal])
        .unwrap();
    let job = node.engine.take_execution_job().unwrap();
    node.engine.on_execution_result(now, job.run()).unwrap();

    // A single member is its own quorum.
    let tx = node.outbox.posted.lock()[0].clone();
    let block = node.outbox.candidates.lock()[0].clone();
    let next = Arc::new(origin.apply_block(&block).unwrap());
    node.engine.on_state_transition(
        now,
        StateTransition {
            solid_state: next,
            output: StateOutput::new(tx.anchor_output_id(), 1, tx.essence.state_hash, 0),
            processed: tx.essence.requests.clone(),
        },
    );
    assert!(node.pool.is_empty());
    assert_eq!(node.engine.round().state_index(), Some(1));
}
