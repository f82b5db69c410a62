//! Chain state persistence for keel.
//!
//! The state manager persists every new solid state together with the block
//! that produced it, and reads the latest pair back when a chain instance
//! boots. Backends implement [`ChainStore`]:
//!
//! - [`MemoryStore`]: in-process maps, used by tests and the devnet
//! - `RocksChainStore`: durable storage behind the `rocksdb-backend` feature
//!
//! # Example
//!
//! ```
//! use keel_storage::{ChainStore, MemoryStore};
//! use keel_types::ChainAddress;
//!
//! let store = MemoryStore::new();
//! assert!(!store.exists(&ChainAddress::from_seed("demo")).unwrap());
//! ```

mod error;
mod memory;
mod traits;

#[cfg(feature = "rocksdb-backend")]
mod rocksdb;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use traits::ChainStore;

#[cfg(feature = "rocksdb-backend")]
pub use rocksdb::{RocksChainStore, RocksDbConfig};

use keel_state::{Block, VirtualState};
use keel_types::ChainAddress;

/// Checks that a loaded state/block pair belongs together.
pub(crate) fn check_record(chain: &ChainAddress, state: &VirtualState, block: &Block) -> Result<()> {
    if state.chain() != *chain {
        return Err(StorageError::Corruption(format!(
            "state belongs to chain {}, expected {}",
            state.chain(),
            chain
        )));
    }
    if state.index() != block.index() {
        return Err(StorageError::Corruption(format!(
            "state index {} does not match last block index {}",
            state.index(),
            block.index()
        )));
    }
    Ok(())
}
