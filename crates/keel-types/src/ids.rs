//! Identifiers for chains, transactions, outputs and requests.

use crate::{HashValue, Result, TypesError};
use serde::{Deserialize, Serialize};

/// Address of a chain on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainAddress(pub HashValue);

impl ChainAddress {
    /// Derives a chain address from a human-readable seed (used by devnets and tests).
    pub fn from_seed(seed: &str) -> Self {
        Self(HashValue::digest(seed.as_bytes()))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a ledger transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub HashValue);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a ledger output: the producing transaction and the output index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId {
    /// Transaction that created the output.
    pub tx_id: TransactionId,
    /// Position of the output within the transaction.
    pub index: u16,
}

impl OutputId {
    /// Encoded length in bytes.
    pub const LEN: usize = HashValue::LEN + 2;

    /// Creates a new output ID.
    pub fn new(tx_id: TransactionId, index: u16) -> Self {
        Self { tx_id, index }
    }

    /// Encodes the ID as `tx_id || index (big-endian)`.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..HashValue::LEN].copy_from_slice(self.tx_id.0.as_bytes());
        bytes[HashValue::LEN..].copy_from_slice(&self.index.to_be_bytes());
        bytes
    }

    /// Decodes an ID produced by [`OutputId::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(TypesError::InvalidLength {
                what: "output id",
                expected: Self::LEN,
                got: bytes.len(),
            });
        }
        let tx_id = TransactionId(HashValue::from_bytes(&bytes[..HashValue::LEN])?);
        let index = u16::from_be_bytes([bytes[HashValue::LEN], bytes[HashValue::LEN + 1]]);
        Ok(Self { tx_id, index })
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id.0.short(), self.index)
    }
}

/// Identifier of a request. Requests are ledger outputs sent to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub OutputId);

impl RequestId {
    /// Creates a request ID from its output coordinates.
    pub fn new(tx_id: TransactionId, index: u16) -> Self {
        Self(OutputId::new(tx_id, index))
    }

    /// Encodes the ID.
    pub fn to_bytes(&self) -> [u8; OutputId::LEN] {
        self.0.to_bytes()
    }

    /// Decodes the ID.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        OutputId::from_bytes(bytes).map(Self)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_id_bytes_roundtrip() {
        let id = OutputId::new(TransactionId(HashValue::digest(b"tx")), 7);
        let parsed = OutputId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_output_id_rejects_short_input() {
        assert!(OutputId::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_request_ids_sort_by_transaction_then_index() {
        let tx = TransactionId(HashValue::from_array([1u8; 32]));
        let a = RequestId::new(tx, 2);
        let b = RequestId::new(tx, 1);
        let mut ids = vec![a, b];
        ids.sort();
        assert_eq!(ids, vec![b, a]);
    }
}
