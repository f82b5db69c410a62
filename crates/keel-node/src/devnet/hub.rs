//! In-process agreement and peer message routing for a devnet committee.

use crate::chain::ChainHandle;
use bytes::Bytes;
use keel_consensus::{Agreement, BatchProposal, ResultBroadcast};
use keel_p2p::{BlockMessage, GetBlock, Message, SignedResult};
use keel_state::Block;
use keel_statemgr::PeerNetwork;
use keel_types::MemberIndex;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Decided sessions kept for late proposers.
const DECIDED_SESSIONS: usize = 64;

#[derive(Default)]
struct AgreementInner {
    pending: HashMap<u64, BTreeMap<MemberIndex, BatchProposal>>,
    decided: HashMap<u64, Vec<BatchProposal>>,
    decided_order: VecDeque<u64>,
    members: BTreeMap<MemberIndex, ChainHandle>,
}

/// Agreement over batch proposals.
///
/// A session is decided by the first `quorum` distinct contributors, ordered
/// by contributor index, and the decision is delivered to every member. A
/// member proposing in an already decided session receives the same
/// decision again.
pub struct AgreementHub {
    quorum: usize,
    inner: Mutex<AgreementInner>,
}

impl AgreementHub {
    /// Creates a hub deciding on `quorum` proposals.
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            inner: Mutex::new(AgreementInner::default()),
        }
    }

    /// Registers a member to receive decisions.
    pub fn attach(&self, handle: ChainHandle) {
        self.inner.lock().members.insert(handle.own_index(), handle);
    }
}

impl Agreement for AgreementHub {
    fn propose(&self, session_id: u64, proposal: BatchProposal) {
        let contributor = proposal.contributor;
        let mut inner = self.inner.lock();

        let decided = inner.decided.get(&session_id).cloned();
        if let Some(decided) = decided {
            let member = inner.members.get(&contributor).cloned();
            drop(inner);
            if let Some(handle) = member {
                tracing::debug!(session_id, contributor, "redelivering decided session");
                handle.deliver_agreement(session_id, decided);
            }
            return;
        }

        let proposals = inner.pending.entry(session_id).or_default();
        proposals.entry(contributor).or_insert(proposal);
        if proposals.len() < self.quorum {
            return;
        }

        let Some(proposals) = inner.pending.remove(&session_id) else {
            return;
        };
        let decided: Vec<BatchProposal> = proposals.into_values().collect();
        inner.decided.insert(session_id, decided.clone());
        inner.decided_order.push_back(session_id);
        while inner.decided_order.len() > DECIDED_SESSIONS {
            if let Some(old) = inner.decided_order.pop_front() {
                inner.decided.remove(&old);
            }
        }
        let members: Vec<ChainHandle> = inner.members.values().cloned().collect();
        drop(inner);

        tracing::debug!(
            session_id,
            contributors = ?decided.iter().map(|p| p.contributor).collect::<Vec<_>>(),
            "session decided"
        );
        for handle in members {
            handle.deliver_agreement(session_id, decided.clone());
        }
    }
}

/// Routes encoded peer messages between committee members.
#[derive(Default)]
pub struct PeerHub {
    members: RwLock<BTreeMap<MemberIndex, ChainHandle>>,
}

impl PeerHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member to receive messages.
    pub fn attach(&self, handle: ChainHandle) {
        self.members.write().insert(handle.own_index(), handle);
    }

    /// The network endpoint of `own`.
    pub fn link(self: &Arc<Self>, own: MemberIndex) -> PeerLink {
        PeerLink {
            hub: self.clone(),
            own,
        }
    }

    /// Decodes `bytes` and hands the message to member `to`.
    pub fn route(&self, from: MemberIndex, to: MemberIndex, bytes: &Bytes) {
        let Some(handle) = self.members.read().get(&to).cloned() else {
            tracing::debug!(from, to, "message for unknown member dropped");
            return;
        };
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(from, to, error = %e, "undecodable peer message dropped");
                return;
            }
        };
        tracing::trace!(from, to, kind = msg.kind(), "routing peer message");
        match msg {
            Message::GetBlock(m) => handle.deliver_get_block(from, m.state_index),
            Message::Block(m) => handle.deliver_block(from, m.block),
            Message::SignedResult(m) => handle.deliver_signed_result(m),
        }
    }

    fn peers_of(&self, own: MemberIndex) -> Vec<MemberIndex> {
        self.members
            .read()
            .keys()
            .copied()
            .filter(|i| *i != own)
            .collect()
    }
}

/// One member's endpoint on the [`PeerHub`].
pub struct PeerLink {
    hub: Arc<PeerHub>,
    own: MemberIndex,
}

impl PeerNetwork for PeerLink {
    fn request_block(&self, peer: MemberIndex, state_index: u32) {
        let bytes = Message::GetBlock(GetBlock { state_index }).encode();
        self.hub.route(self.own, peer, &bytes);
    }

    fn send_block(&self, peer: MemberIndex, block: &Block) {
        let bytes = Message::Block(BlockMessage {
            block: block.clone(),
        })
        .encode();
        self.hub.route(self.own, peer, &bytes);
    }
}

impl ResultBroadcast for PeerLink {
    fn broadcast_signed_result(&self, result: &SignedResult) {
        let bytes = Message::SignedResult(result.clone()).encode();
        for peer in self.hub.peers_of(self.own) {
            self.hub.route(self.own, peer, &bytes);
        }
    }
}
