//! The virtual state of a chain.

use crate::codec::{get_bytes, get_count, get_hash, get_u32, get_u64, get_u8, malformed, put_bytes};
use crate::{Block, Mutation, Result, StateError, ENCODING_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_types::{ChainAddress, HashValue};
use std::collections::BTreeMap;

/// Domain prefix of the origin state hash.
const ORIGIN_DOMAIN: &[u8] = b"origin";

/// An immutable snapshot of chain state at one index.
///
/// New snapshots are derived with [`VirtualState::apply_block`]; the hash chains
/// every block ever applied, so equal hashes mean equal histories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualState {
    chain: ChainAddress,
    index: u32,
    hash: HashValue,
    timestamp_ms: u64,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl VirtualState {
    /// The state of a freshly deployed chain.
    pub fn origin(chain: ChainAddress) -> Self {
        Self {
            chain,
            index: 0,
            hash: HashValue::digest_parts(&[ORIGIN_DOMAIN, chain.as_bytes()]),
            timestamp_ms: 0,
            data: BTreeMap::new(),
        }
    }

    /// Chain this state belongs to.
    pub fn chain(&self) -> ChainAddress {
        self.chain
    }

    /// State index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// State hash.
    pub fn hash(&self) -> HashValue {
        self.hash
    }

    /// Timestamp of the last applied block.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Reads a key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Derives the next state. `block.index()` must be exactly `self.index() + 1`.
    pub fn apply_block(&self, block: &Block) -> Result<Self> {
        let expected = self.index.checked_add(1).ok_or(StateError::IndexMismatch {
            expected: u32::MAX,
            got: block.index(),
        })?;
        if block.index() != expected {
            return Err(StateError::IndexMismatch {
                expected,
                got: block.index(),
            });
        }

        let mut data = self.data.clone();
        for update in block.updates() {
            for mutation in &update.mutations {
                match mutation {
                    Mutation::Set { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    Mutation::Del { key } => {
                        data.remove(key);
                    }
                }
            }
        }

        let essence = block.essence_hash();
        Ok(Self {
            chain: self.chain,
            index: expected,
            hash: HashValue::digest_parts(&[self.hash.as_bytes(), essence.as_bytes()]),
            timestamp_ms: block.timestamp_ms(),
            data,
        })
    }

    /// Encodes the state for persistence.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        buf.put_slice(self.chain.as_bytes());
        buf.put_u32(self.index);
        buf.put_slice(self.hash.as_bytes());
        buf.put_u64(self.timestamp_ms);
        buf.put_u32(self.data.len() as u32);
        for (key, value) in &self.data {
            put_bytes(&mut buf, key);
            put_bytes(&mut buf, value);
        }
        buf.freeze()
    }

    /// Decodes a state produced by [`VirtualState::encode`].
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let version = get_u8(&mut buf, "state")?;
        if version != ENCODING_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let chain = ChainAddress(get_hash(&mut buf, "state chain")?);
        let index = get_u32(&mut buf, "state index")?;
        let hash = get_hash(&mut buf, "state hash")?;
        let timestamp_ms = get_u64(&mut buf, "state timestamp")?;
        let count = get_count(&mut buf, 8, "state entries")?;
        let mut data = BTreeMap::new();
        for _ in 0..count {
            let key = get_bytes(&mut buf, "state key")?;
            let value = get_bytes(&mut buf, "state value")?;
            data.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(malformed("state", format!("{} trailing bytes", buf.remaining())));
        }
        Ok(Self {
            chain,
            index,
            hash,
            timestamp_ms,
            data,
        })
    }
}
