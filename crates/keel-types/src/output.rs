//! Anchor outputs reported by the ledger.

use crate::{HashValue, OutputId, Result};
use serde::{Deserialize, Serialize};

/// The ledger's current anchor commitment for a chain.
///
/// Arrives only from the node connection. `state_data` carries the raw bytes of
/// the committed state hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateOutput {
    /// Identifier of the anchor output.
    pub id: OutputId,
    /// State index committed by this output.
    pub state_index: u32,
    /// Raw state hash bytes.
    pub state_data: Vec<u8>,
    /// Ledger timestamp of the output (unix milliseconds).
    pub timestamp_ms: u64,
}

impl StateOutput {
    /// Creates an output committing to `state_hash`.
    pub fn new(id: OutputId, state_index: u32, state_hash: HashValue, timestamp_ms: u64) -> Self {
        Self {
            id,
            state_index,
            state_data: state_hash.as_bytes().to_vec(),
            timestamp_ms,
        }
    }

    /// Decodes the committed state hash.
    ///
    /// Fails if the embedded data is not exactly one hash.
    pub fn state_hash(&self) -> Result<HashValue> {
        HashValue::from_bytes(&self.state_data)
    }
}
