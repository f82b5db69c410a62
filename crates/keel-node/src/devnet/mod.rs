//! In-process committee.
//!
//! Runs every member of one chain inside the current process. Members share
//! an in-memory [`Ledger`], reach agreement through an [`AgreementHub`] and
//! exchange encoded peer messages through a [`PeerHub`]. Requests are placed
//! in every member's pool directly, as if all members observed them on the
//! ledger at once.

mod hub;
mod ledger;
mod vm;

pub use hub::{AgreementHub, PeerHub, PeerLink};
pub use ledger::{Ledger, LedgerConnection};
pub use vm::{KvVm, ENTROPY_KEY};

use crate::chain::{ChainHandle, ChainInstance, ChainPorts};
use crate::config::{NodeConfig, StorageBackend};
use crate::error::Result;
use crate::observability::NodeMetrics;
use keel_consensus::RequestPool;
use keel_storage::{ChainStore, MemoryStore};
use keel_types::{
    ChainAddress, Committee, HashValue, MemberIndex, Request, RequestId, StaticCommittee,
    TransactionId,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How often wait conditions are re-checked.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running in-process committee.
pub struct Devnet {
    chain: ChainAddress,
    ledger: Arc<Ledger>,
    pools: Vec<Arc<RequestPool>>,
    instances: Vec<ChainInstance>,
    submitted: u64,
}

impl Devnet {
    /// Starts every member of the committee described by `config.devnet`.
    pub async fn start(config: &NodeConfig, metrics: &NodeMetrics) -> Result<Self> {
        let keys = config.devnet.member_keys()?;
        let members: Vec<_> = keys.iter().map(|k| k.verification_key()).collect();
        let chain = ChainAddress::from_seed(&config.devnet.chain);
        let quorum = config.consensus.quorum;

        let verifier = StaticCommittee::new(members.clone(), 0, keys[0].clone(), quorum)?;
        let quorum_size = verifier.quorum();
        let agreement = Arc::new(AgreementHub::new(quorum_size));
        let ledger = Arc::new(Ledger::new(chain, Arc::new(verifier)));
        let peers = Arc::new(PeerHub::new());

        tracing::info!(
            chain = %chain,
            size = members.len(),
            quorum = quorum_size,
            "starting devnet committee"
        );

        let mut pools = Vec::with_capacity(keys.len());
        let mut instances: Vec<ChainInstance> = Vec::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            let index = i as MemberIndex;
            let started = Self::start_member(
                config,
                metrics,
                chain,
                || StaticCommittee::new(members.clone(), index, key, quorum),
                &ledger,
                &agreement,
                &peers,
            );
            match started {
                Ok((instance, pool)) => {
                    let handle = instance.handle();
                    ledger.attach(handle.clone());
                    agreement.attach(handle.clone());
                    peers.attach(handle);
                    pools.push(pool);
                    instances.push(instance);
                }
                Err(e) => {
                    for instance in instances {
                        instance.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            chain,
            ledger,
            pools,
            instances,
            submitted: 0,
        })
    }

    fn start_member(
        config: &NodeConfig,
        metrics: &NodeMetrics,
        chain: ChainAddress,
        committee: impl FnOnce() -> keel_types::Result<StaticCommittee>,
        ledger: &Arc<Ledger>,
        agreement: &Arc<AgreementHub>,
        peers: &Arc<PeerHub>,
    ) -> Result<(ChainInstance, Arc<RequestPool>)> {
        let committee: Arc<dyn Committee> = Arc::new(committee()?);
        let index = committee.own_index();
        let pool = Arc::new(RequestPool::with_defaults());
        let connection = Arc::new(LedgerConnection::new(ledger.clone(), index));
        let link = Arc::new(peers.link(index));
        let ports = ChainPorts {
            store: open_store(config, index)?,
            mempool: pool.clone(),
            vm: Arc::new(KvVm),
            agreement: agreement.clone(),
            node: connection.clone(),
            fetcher: connection,
            peers: link.clone(),
            broadcast: link,
        };
        let instance = ChainInstance::start(
            chain,
            committee,
            ports,
            config.consensus.to_config(),
            config.state_manager.to_config(),
            metrics,
        )?;
        Ok((instance, pool))
    }

    /// Chain served by the committee.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// The shared ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Inbound handles of all members.
    pub fn handles(&self) -> Vec<ChainHandle> {
        self.instances.iter().map(|i| i.handle()).collect()
    }

    /// Places a new request in every member's pool.
    pub fn submit(&mut self, payload: impl Into<Vec<u8>>) -> RequestId {
        self.submitted += 1;
        let id = RequestId::new(
            TransactionId(HashValue::digest_parts(&[
                self.chain.as_bytes().as_slice(),
                &self.submitted.to_be_bytes(),
            ])),
            0,
        );
        let request = Request::new(id, payload, unix_millis());
        for pool in &self.pools {
            if let Err(e) = pool.add(request.clone()) {
                tracing::warn!(request = %id, error = %e, "request not pooled");
            }
        }
        tracing::debug!(request = %id, "request submitted");
        id
    }

    /// Waits until confirmed transactions processed at least `count`
    /// requests. Returns false on timeout.
    pub async fn wait_for_processed(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.ledger.processed_count() >= count)
            .await
    }

    /// Waits until every running member reached solid index `index`.
    /// Returns false on timeout.
    pub async fn wait_for_solid_index(&self, index: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            self.instances
                .iter()
                .filter(|i| !i.is_dismissed())
                .all(|i| i.handle().state_status().solid_index >= index)
        })
        .await
    }

    async fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stops every member.
    pub async fn shutdown(self) {
        for instance in self.instances {
            instance.shutdown().await;
        }
        tracing::info!(chain = %self.chain, "devnet stopped");
    }
}

fn open_store(config: &NodeConfig, member: MemberIndex) -> Result<Arc<dyn ChainStore>> {
    match config.storage {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb-backend")]
        StorageBackend::Rocksdb => {
            let path = config.data_dir.join(format!("member-{member}"));
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(keel_storage::RocksChainStore::open_default(path)?))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackend::Rocksdb => {
            let _ = member;
            Err(crate::error::NodeError::InvalidConfig(
                "rocksdb storage requires the rocksdb-backend feature".into(),
            ))
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
