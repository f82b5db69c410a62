//! Storage backend traits.

use crate::Result;
use keel_state::{Block, VirtualState};
use keel_types::ChainAddress;
use std::sync::Arc;

/// Persistence for chain states and blocks.
///
/// Only the latest state of a chain is kept; blocks are kept by index so
/// lagging peers can be served.
pub trait ChainStore: Send + Sync {
    /// Whether any state has been committed for the chain.
    fn exists(&self, chain: &ChainAddress) -> Result<bool>;

    /// Loads the latest state and the block that produced it.
    ///
    /// Fails with `NotFound` when nothing was committed and with `Corruption`
    /// when the pair is inconsistent.
    fn load(&self, chain: &ChainAddress) -> Result<(VirtualState, Block)>;

    /// Atomically stores a new latest state together with its block.
    fn commit(&self, state: &VirtualState, block: &Block) -> Result<()>;

    /// Loads the block at `index`, if stored.
    fn load_block(&self, chain: &ChainAddress, index: u32) -> Result<Option<Block>>;

    /// Flush any pending writes to durable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ChainStore + ?Sized> ChainStore for Arc<T> {
    fn exists(&self, chain: &ChainAddress) -> Result<bool> {
        (**self).exists(chain)
    }

    fn load(&self, chain: &ChainAddress) -> Result<(VirtualState, Block)> {
        (**self).load(chain)
    }

    fn commit(&self, state: &VirtualState, block: &Block) -> Result<()> {
        (**self).commit(state, block)
    }

    fn load_block(&self, chain: &ChainAddress, index: u32) -> Result<Option<Block>> {
        (**self).load_block(chain, index)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}
