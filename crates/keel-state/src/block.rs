//! Blocks: the ordered state updates for one state index.

use crate::codec::{get_bytes, get_count, get_output_id, get_u32, get_u64, get_u8, malformed, put_bytes};
use crate::{Result, StateError, ENCODING_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_types::{HashValue, OutputId, RequestId};
use std::collections::HashSet;

const TAG_SET: u8 = 1;
const TAG_DEL: u8 = 2;

/// A single key/value change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Sets `key` to `value`.
    Set {
        /// Key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Removes `key`.
    Del {
        /// Key.
        key: Vec<u8>,
    },
}

impl Mutation {
    /// Convenience constructor for [`Mutation::Set`].
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for [`Mutation::Del`].
    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Mutation::Del { key: key.into() }
    }
}

/// The effect of processing one request (or a request-less system update).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// Request that produced the update, if any.
    pub request_id: Option<RequestId>,
    /// Timestamp the update was produced at.
    pub timestamp_ms: u64,
    /// Ordered mutations.
    pub mutations: Vec<Mutation>,
}

impl StateUpdate {
    /// Creates an update for a request.
    pub fn for_request(request_id: RequestId, timestamp_ms: u64, mutations: Vec<Mutation>) -> Self {
        Self {
            request_id: Some(request_id),
            timestamp_ms,
            mutations,
        }
    }
}

/// Ordered list of state updates for one index.
///
/// Blocks are validated on construction and on decoding, so a `Block` value is
/// never malformed. The approving output id is set once the ledger confirms
/// the transition and is not covered by [`Block::essence_hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    index: u32,
    timestamp_ms: u64,
    updates: Vec<StateUpdate>,
    approving_output_id: Option<OutputId>,
}

impl Block {
    /// Creates a block, rejecting it if it is malformed.
    pub fn new(index: u32, timestamp_ms: u64, updates: Vec<StateUpdate>) -> Result<Self> {
        let block = Self {
            index,
            timestamp_ms,
            updates,
            approving_output_id: None,
        };
        block.validate()?;
        Ok(block)
    }

    fn validate(&self) -> Result<()> {
        if self.index == 0 {
            return Err(StateError::ReservedIndex);
        }
        if self.updates.is_empty() {
            return Err(StateError::EmptyBlock);
        }
        let mut seen = HashSet::new();
        for id in self.request_ids() {
            if !seen.insert(id) {
                return Err(StateError::DuplicateRequest(id));
            }
        }
        Ok(())
    }

    /// State index this block produces.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Block timestamp.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// The updates, in application order.
    pub fn updates(&self) -> &[StateUpdate] {
        &self.updates
    }

    /// Anchor output that confirmed this block, once known.
    pub fn approving_output_id(&self) -> Option<OutputId> {
        self.approving_output_id
    }

    /// Records the anchor output that confirmed this block.
    pub fn set_approving_output_id(&mut self, id: OutputId) {
        self.approving_output_id = Some(id);
    }

    /// Request ids processed by this block, in block order.
    pub fn request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.updates.iter().filter_map(|u| u.request_id)
    }

    /// Hash of the block contents, excluding the approving output id.
    pub fn essence_hash(&self) -> HashValue {
        let mut buf = BytesMut::new();
        self.encode_essence(&mut buf);
        HashValue::digest(&buf)
    }

    fn encode_essence(&self, buf: &mut BytesMut) {
        buf.put_u8(ENCODING_VERSION);
        buf.put_u32(self.index);
        buf.put_u64(self.timestamp_ms);
        buf.put_u32(self.updates.len() as u32);
        for update in &self.updates {
            match update.request_id {
                Some(id) => {
                    buf.put_u8(1);
                    buf.put_slice(&id.to_bytes());
                }
                None => buf.put_u8(0),
            }
            buf.put_u64(update.timestamp_ms);
            buf.put_u32(update.mutations.len() as u32);
            for mutation in &update.mutations {
                match mutation {
                    Mutation::Set { key, value } => {
                        buf.put_u8(TAG_SET);
                        put_bytes(buf, key);
                        put_bytes(buf, value);
                    }
                    Mutation::Del { key } => {
                        buf.put_u8(TAG_DEL);
                        put_bytes(buf, key);
                    }
                }
            }
        }
    }

    /// Encodes the block, including the approving output id.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_essence(&mut buf);
        match self.approving_output_id {
            Some(id) => {
                buf.put_u8(1);
                buf.put_slice(&id.to_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Decodes and validates a block. Trailing bytes are rejected.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let version = get_u8(&mut buf, "block")?;
        if version != ENCODING_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let index = get_u32(&mut buf, "block index")?;
        let timestamp_ms = get_u64(&mut buf, "block timestamp")?;

        // Smallest update: flag + timestamp + mutation count.
        let update_count = get_count(&mut buf, 1 + 8 + 4, "update count")?;
        let mut updates = Vec::with_capacity(update_count);
        for _ in 0..update_count {
            let request_id = match get_u8(&mut buf, "request flag")? {
                0 => None,
                1 => Some(RequestId(get_output_id(&mut buf, "request id")?)),
                other => return Err(malformed("request flag", format!("unexpected value {other}"))),
            };
            let timestamp_ms = get_u64(&mut buf, "update timestamp")?;

            // Smallest mutation: tag + key length.
            let mutation_count = get_count(&mut buf, 1 + 4, "mutation count")?;
            let mut mutations = Vec::with_capacity(mutation_count);
            for _ in 0..mutation_count {
                let mutation = match get_u8(&mut buf, "mutation tag")? {
                    TAG_SET => {
                        let key = get_bytes(&mut buf, "mutation key")?;
                        let value = get_bytes(&mut buf, "mutation value")?;
                        Mutation::Set { key, value }
                    }
                    TAG_DEL => Mutation::Del {
                        key: get_bytes(&mut buf, "mutation key")?,
                    },
                    other => return Err(malformed("mutation tag", format!("unknown tag {other}"))),
                };
                mutations.push(mutation);
            }
            updates.push(StateUpdate {
                request_id,
                timestamp_ms,
                mutations,
            });
        }

        let approving_output_id = match get_u8(&mut buf, "approving flag")? {
            0 => None,
            1 => Some(get_output_id(&mut buf, "approving output id")?),
            other => return Err(malformed("approving flag", format!("unexpected value {other}"))),
        };

        if buf.has_remaining() {
            return Err(malformed("block", format!("{} trailing bytes", buf.remaining())));
        }

        let block = Self {
            index,
            timestamp_ms,
            updates,
            approving_output_id,
        };
        block.validate()?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::TransactionId;
    use proptest::prelude::*;

    fn request(i: u16) -> RequestId {
        RequestId::new(TransactionId(HashValue::digest(b"requests")), i)
    }

    fn sample_block() -> Block {
        Block::new(
            3,
            1_700,
            vec![
                StateUpdate::for_request(request(1), 1_600, vec![Mutation::set("a", "1")]),
                StateUpdate::for_request(request(2), 1_650, vec![Mutation::del("b")]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_block_encode_decode() {
        let mut block = sample_block();
        block.set_approving_output_id(OutputId::new(TransactionId(HashValue::digest(b"tx")), 0));

        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.request_ids().collect::<Vec<_>>(), vec![request(1), request(2)]);
    }

    #[test]
    fn test_essence_hash_ignores_approving_output() {
        let block = sample_block();
        let before = block.essence_hash();

        let mut approved = block.clone();
        approved.set_approving_output_id(OutputId::default());
        assert_eq!(approved.essence_hash(), before);
        assert_ne!(approved.encode(), block.encode());
    }

    #[test]
    fn test_rejects_malformed_blocks() {
        assert_eq!(Block::new(1, 0, vec![]).unwrap_err(), StateError::EmptyBlock);

        let update = StateUpdate::for_request(request(1), 0, vec![]);
        assert_eq!(
            Block::new(0, 0, vec![update.clone()]).unwrap_err(),
            StateError::ReservedIndex
        );
        assert_eq!(
            Block::new(1, 0, vec![update.clone(), update]).unwrap_err(),
            StateError::DuplicateRequest(request(1))
        );
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample_block().encode().to_vec();
        bytes.push(0);
        assert!(matches!(
            Block::decode(&bytes),
            Err(StateError::Malformed { what: "block", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = sample_block().encode().to_vec();
        bytes[0] = 9;
        assert_eq!(Block::decode(&bytes).unwrap_err(), StateError::UnsupportedVersion(9));
    }

    #[test]
    fn test_decode_rejects_huge_count() {
        let mut bytes = vec![ENCODING_VERSION];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(Block::decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Block::decode(&data);
        }

        #[test]
        fn prop_truncated_encoding_is_rejected(cut in 0usize..64) {
            let bytes = sample_block().encode();
            let cut = cut.min(bytes.len() - 1);
            prop_assert!(Block::decode(&bytes[..cut]).is_err());
        }
    }
}
