//! In-memory ledger shared by a devnet committee.

use crate::chain::ChainHandle;
use keel_consensus::{InclusionState, NodeConnection};
use keel_state::VirtualState;
use keel_statemgr::OutputFetcher;
use keel_types::{
    ChainAddress, Committee, HashValue, MemberIndex, OutputId, RequestId, SignedTransaction,
    StateOutput, TransactionId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

struct Inner {
    anchor: StateOutput,
    outputs: HashMap<OutputId, StateOutput>,
    transactions: HashMap<TransactionId, InclusionState>,
    processed: HashSet<RequestId>,
    subscribers: BTreeMap<MemberIndex, ChainHandle>,
}

/// Holds the anchor output of one chain and confirms quorum-signed
/// transactions that consume it.
pub struct Ledger {
    chain: ChainAddress,
    verifier: Arc<dyn Committee>,
    inner: Mutex<Inner>,
}

impl Ledger {
    /// Creates a ledger whose anchor commits the origin state of `chain`.
    ///
    /// `verifier` checks transaction signatures and the quorum.
    pub fn new(chain: ChainAddress, verifier: Arc<dyn Committee>) -> Self {
        let origin = VirtualState::origin(chain);
        let anchor = StateOutput::new(
            OutputId::new(
                TransactionId(HashValue::digest_parts(&[b"origin".as_slice(), chain.as_bytes()])),
                0,
            ),
            0,
            origin.hash(),
            0,
        );
        let mut outputs = HashMap::new();
        outputs.insert(anchor.id, anchor.clone());
        Self {
            chain,
            verifier,
            inner: Mutex::new(Inner {
                anchor,
                outputs,
                transactions: HashMap::new(),
                processed: HashSet::new(),
                subscribers: BTreeMap::new(),
            }),
        }
    }

    /// Chain this ledger anchors.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// Starts delivering new anchor outputs to a chain instance.
    pub fn attach(&self, handle: ChainHandle) {
        self.inner.lock().subscribers.insert(handle.own_index(), handle);
    }

    /// Current anchor output.
    pub fn anchor(&self) -> StateOutput {
        self.inner.lock().anchor.clone()
    }

    /// Number of requests processed by confirmed transactions.
    pub fn processed_count(&self) -> usize {
        self.inner.lock().processed.len()
    }

    /// Whether a confirmed transaction processed `id`.
    pub fn is_processed(&self, id: &RequestId) -> bool {
        self.inner.lock().processed.contains(id)
    }

    /// Inclusion state of a transaction.
    pub fn inclusion_state(&self, tx_id: &TransactionId) -> InclusionState {
        self.inner
            .lock()
            .transactions
            .get(tx_id)
            .copied()
            .unwrap_or(InclusionState::Unknown)
    }

    /// A confirmed anchor output by id.
    pub fn output(&self, id: &OutputId) -> Option<StateOutput> {
        self.inner.lock().outputs.get(id).cloned()
    }

    /// Submits a transaction. Posting the same transaction again is a no-op.
    ///
    /// A transaction is confirmed when it consumes the current anchor output
    /// and carries a quorum of valid signatures; otherwise it is rejected.
    pub fn post(&self, tx: &SignedTransaction) -> InclusionState {
        let tx_id = tx.id();
        let mut inner = self.inner.lock();
        if let Some(state) = inner.transactions.get(&tx_id) {
            return *state;
        }

        if tx.essence.chain != self.chain || tx.essence.consumed_output != inner.anchor.id {
            tracing::debug!(tx = %tx_id, consumed = %tx.essence.consumed_output, "transaction consumes a spent output");
            inner.transactions.insert(tx_id, InclusionState::Rejected);
            return InclusionState::Rejected;
        }
        if let Err(e) = tx.verify(self.verifier.as_ref()) {
            tracing::warn!(tx = %tx_id, error = %e, "transaction rejected");
            inner.transactions.insert(tx_id, InclusionState::Rejected);
            return InclusionState::Rejected;
        }

        let output = StateOutput::new(
            tx.anchor_output_id(),
            tx.essence.state_index,
            tx.essence.state_hash,
            tx.essence.timestamp_ms,
        );
        inner.transactions.insert(tx_id, InclusionState::Confirmed);
        inner.processed.extend(tx.essence.requests.iter().copied());
        inner.outputs.insert(output.id, output.clone());
        inner.anchor = output.clone();
        let subscribers: Vec<ChainHandle> = inner.subscribers.values().cloned().collect();
        drop(inner);

        tracing::info!(
            tx = %tx_id,
            state_index = output.state_index,
            requests = tx.essence.requests.len(),
            "transaction confirmed"
        );
        for handle in subscribers {
            handle.deliver_output(output.clone());
        }
        InclusionState::Confirmed
    }

    fn subscriber(&self, member: MemberIndex) -> Option<ChainHandle> {
        self.inner.lock().subscribers.get(&member).cloned()
    }
}

/// One member's connection to the [`Ledger`].
pub struct LedgerConnection {
    ledger: Arc<Ledger>,
    member: MemberIndex,
}

impl LedgerConnection {
    /// Creates the connection of `member`.
    pub fn new(ledger: Arc<Ledger>, member: MemberIndex) -> Self {
        Self { ledger, member }
    }

    fn deliver(&self, f: impl FnOnce(&ChainHandle)) {
        match self.ledger.subscriber(self.member) {
            Some(handle) => f(&handle),
            None => tracing::debug!(member = self.member, "ledger answer for unattached member dropped"),
        }
    }
}

impl NodeConnection for LedgerConnection {
    fn post_transaction(&self, transaction: &SignedTransaction) {
        self.ledger.post(transaction);
    }

    fn pull_inclusion_state(&self, tx_id: &TransactionId) {
        let state = self.ledger.inclusion_state(tx_id);
        self.deliver(|handle| handle.deliver_inclusion_state(*tx_id, state));
    }
}

impl OutputFetcher for LedgerConnection {
    fn pull_state(&self, chain: &ChainAddress) {
        if *chain != self.ledger.chain() {
            return;
        }
        let anchor = self.ledger.anchor();
        self.deliver(|handle| handle.deliver_output(anchor));
    }

    fn pull_confirmed_output(&self, chain: &ChainAddress, output_id: &OutputId) {
        if *chain != self.ledger.chain() {
            return;
        }
        match self.ledger.output(output_id) {
            Some(output) => self.deliver(|handle| handle.deliver_output(output)),
            None => tracing::debug!(member = self.member, output = %output_id, "unknown output requested"),
        }
    }
}
