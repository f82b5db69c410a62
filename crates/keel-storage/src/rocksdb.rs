//! RocksDB persistent chain store.
//!
//! Column family `states` maps a chain address to its latest encoded state;
//! `blocks` maps `chain || index (big-endian)` to an encoded block. A state and
//! its block are written in one `WriteBatch`.

use crate::{check_record, ChainStore, Result, StorageError};
use keel_state::{Block, VirtualState};
use keel_types::ChainAddress;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded,
    Options, WriteBatch, WriteOptions, DB,
};
use std::path::Path;

/// RocksDB storage configuration.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Path to the database directory.
    pub path: std::path::PathBuf,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Enable LZ4 compression.
    pub compression_enabled: bool,

    /// Bloom filter bits per key (0 to disable).
    pub bloom_filter_bits: i32,

    /// Sync the WAL on every commit.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("./data/chains"),
            write_buffer_size: 16 * 1024 * 1024,
            compression_enabled: true,
            bloom_filter_bits: 10,
            sync_writes: true,
        }
    }
}

const CF_STATES: &str = "states";
const CF_BLOCKS: &str = "blocks";

fn io_err(e: rocksdb::Error) -> StorageError {
    StorageError::Io(std::io::Error::other(e.to_string()))
}

fn block_key(chain: &ChainAddress, index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(chain.as_bytes());
    key[32..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Durable chain store backed by RocksDB.
pub struct RocksChainStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: RocksDbConfig,
}

impl RocksChainStore {
    /// Opens or creates a database.
    pub fn open(config: RocksDbConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(config.write_buffer_size);

        if config.compression_enabled {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let mut block_opts = BlockBasedOptions::default();
        if config.bloom_filter_bits > 0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_STATES, opts.clone()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, opts.clone()),
        ];

        let db = DB::open_cf_descriptors(&opts, &config.path, cfs).map_err(io_err)?;
        tracing::info!(path = %config.path.display(), "opened chain store");

        Ok(Self { db, config })
    }

    /// Opens with default configuration.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(RocksDbConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Corruption(format!("missing column family {name}")))
    }
}

impl ChainStore for RocksChainStore {
    fn exists(&self, chain: &ChainAddress) -> Result<bool> {
        self.db
            .get_pinned_cf(self.cf(CF_STATES)?, chain.as_bytes())
            .map(|opt| opt.is_some())
            .map_err(io_err)
    }

    fn load(&self, chain: &ChainAddress) -> Result<(VirtualState, Block)> {
        let state_bytes = self
            .db
            .get_cf(self.cf(CF_STATES)?, chain.as_bytes())
            .map_err(io_err)?
            .ok_or_else(|| StorageError::NotFound(format!("state of chain {chain}")))?;
        let state = VirtualState::decode(&state_bytes)?;

        let block = self.load_block(chain, state.index())?.ok_or_else(|| {
            StorageError::Corruption(format!("missing block {} of chain {chain}", state.index()))
        })?;
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
        let chain = state.chain();
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_BLOCKS)?,
            block_key(&chain, block.index()),
            block.encode(),
        );
        batch.put_cf(self.cf(CF_STATES)?, chain.as_bytes(), state.encode());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(io_err)?;

        tracing::debug!(chain = %chain, state_index = state.index(), "state committed");
        Ok(())
    }

    fn load_block(&self, chain: &ChainAddress, index: u32) -> Result<Option<Block>> {
        match self
            .db
            .get_cf(self.cf(CF_BLOCKS)?, block_key(chain, index))
            .map_err(io_err)?
        {
            Some(data) => Ok(Some(Block::decode(&data)?)),
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{Mutation, StateUpdate};
    use keel_types::{HashValue, RequestId, TransactionId};
    use tempfile::tempdir;

    #[test]
    fn test_rocks_commit_survives_reopen() {
        let dir = tempdir().unwrap();
        let chain = ChainAddress::from_seed("rocks");
        let id = RequestId::new(TransactionId(HashValue::digest(b"r")), 0);
        let block = Block::new(1, 5, vec![StateUpdate::for_request(id, 5, vec![Mutation::set("a", "b")])]).unwrap();
        let state = VirtualState::origin(chain).apply_block(&block).unwrap();

        {
            let store = RocksChainStore::open_default(dir.path()).unwrap();
            assert!(!store.exists(&chain).unwrap());
            store.commit(&state, &block).unwrap();
            store.flush().unwrap();
        }

        let store = RocksChainStore::open_default(dir.path()).unwrap();
        assert!(store.exists(&chain).unwrap());
        let (loaded, last) = store.load(&chain).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(last, block);
    }
}
