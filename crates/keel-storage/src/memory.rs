//! In-memory chain store.

use crate::{check_record, ChainStore, Result, StorageError};
use bytes::Bytes;
use keel_state::{Block, VirtualState};
use keel_types::ChainAddress;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Encoded records of one chain.
#[derive(Debug, Default, Clone)]
struct ChainRecord {
    state: Option<Bytes>,
    blocks: BTreeMap<u32, Bytes>,
}

/// Thread-safe in-memory store.
///
/// Records are kept in their encoded form so that loads go through the same
/// decoding and consistency checks as a durable backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<ChainAddress, ChainRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the raw latest-state record of a chain.
    ///
    /// Intended for tests that need to simulate a damaged record.
    pub fn put_raw_state(&self, chain: ChainAddress, data: Bytes) {
        self.chains.write().entry(chain).or_default().state = Some(data);
    }

    /// Number of blocks stored for a chain.
    pub fn block_count(&self, chain: &ChainAddress) -> usize {
        self.chains
            .read()
            .get(chain)
            .map(|r| r.blocks.len())
            .unwrap_or(0)
    }
}

impl ChainStore for MemoryStore {
    fn exists(&self, chain: &ChainAddress) -> Result<bool> {
        Ok(self
            .chains
            .read()
            .get(chain)
            .is_some_and(|r| r.state.is_some()))
    }

    fn load(&self, chain: &ChainAddress) -> Result<(VirtualState, Block)> {
        let chains = self.chains.read();
        let record = chains
            .get(chain)
            .ok_or_else(|| StorageError::NotFound(format!("chain {chain}")))?;
        let state_bytes = record
            .state
            .as_ref()
            .ok_or_else(|| StorageError::NotFound(format!("state of chain {chain}")))?;
        let state = VirtualState::decode(state_bytes)?;
        let block_bytes = record.blocks.get(&state.index()).ok_or_else(|| {
            StorageError::Corruption(format!("missing block {} of chain {chain}", state.index()))
        })?;
        let block = Block::decode(block_bytes)?;
        check_record(chain, &state, &block)?;
        Ok((state, block))
    }

    fn commit(&self, state: &VirtualState, block: &Block) -> Result<()> {
        if state.index() != block.index() {
            return Err(StorageError::Corruption(format!(
                "refusing to commit state {} with block {}",
                state.index(),
                block.index()
            )));
        }
        let mut chains = self.chains.write();
        let record = chains.entry(state.chain()).or_default();
        record.blocks.insert(block.index(), block.encode());
        record.state = Some(state.encode());
        tracing::trace!(chain = %state.chain(), state_index = state.index(), "state committed");
        Ok(())
    }

    fn load_block(&self, chain: &ChainAddress, index: u32) -> Result<Option<Block>> {
        let chains = self.chains.read();
        match chains.get(chain).and_then(|r| r.blocks.get(&index)) {
            Some(bytes) => Ok(Some(Block::decode(bytes)?)),
            None => Ok(None),
        }
    }
}
