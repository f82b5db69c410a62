//! Anchor transactions produced by a consensus round.

use crate::{
    ChainAddress, Committee, HashValue, MemberIndex, OutputId, RequestId, Result, Signature,
    TransactionId, TypesError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Domain separator for essence signing bytes.
const ESSENCE_DOMAIN: &[u8] = b"keel-essence:";

/// The unsigned body of an anchor transaction.
///
/// Consumes the current anchor output and commits the next state hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEssence {
    /// Chain being advanced.
    pub chain: ChainAddress,
    /// Anchor output consumed by this transaction.
    pub consumed_output: OutputId,
    /// State index committed by the new anchor output.
    pub state_index: u32,
    /// State hash committed by the new anchor output.
    pub state_hash: HashValue,
    /// Requests processed in this transition.
    pub requests: Vec<RequestId>,
    /// Agreed timestamp of the transition.
    pub timestamp_ms: u64,
}

impl TransactionEssence {
    /// Returns the canonical bytes covered by committee signatures.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            ESSENCE_DOMAIN.len() + 32 + OutputId::LEN + 4 + 32 + 8 + 4 + self.requests.len() * OutputId::LEN,
        );
        data.extend_from_slice(ESSENCE_DOMAIN);
        data.extend_from_slice(self.chain.as_bytes());
        data.extend_from_slice(&self.consumed_output.to_bytes());
        data.extend_from_slice(&self.state_index.to_be_bytes());
        data.extend_from_slice(self.state_hash.as_bytes());
        data.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        data.extend_from_slice(&(self.requests.len() as u32).to_be_bytes());
        for id in &self.requests {
            data.extend_from_slice(&id.to_bytes());
        }
        data
    }

    /// Hash of the signing bytes. Signatures are made over this value.
    pub fn hash(&self) -> HashValue {
        HashValue::digest(&self.signing_bytes())
    }
}

/// An essence together with a quorum of member signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// The signed body.
    pub essence: TransactionEssence,
    /// Member signatures, one per contributing member.
    pub signatures: Vec<(MemberIndex, Signature)>,
}

impl SignedTransaction {
    /// Creates a signed transaction.
    pub fn new(essence: TransactionEssence, signatures: Vec<(MemberIndex, Signature)>) -> Self {
        Self {
            essence,
            signatures,
        }
    }

    /// Transaction identifier, equal to the essence hash.
    pub fn id(&self) -> TransactionId {
        TransactionId(self.essence.hash())
    }

    /// The anchor output created by this transaction once included.
    pub fn anchor_output_id(&self) -> OutputId {
        OutputId::new(self.id(), 0)
    }

    /// Checks that the transaction carries a quorum of distinct, valid member signatures.
    pub fn verify(&self, committee: &dyn Committee) -> Result<()> {
        let digest = self.essence.hash();
        let mut seen = HashSet::with_capacity(self.signatures.len());

        for (index, signature) in &self.signatures {
            if !seen.insert(*index) {
                return Err(TypesError::InvalidTransaction(format!(
                    "duplicate signature from member {index}"
                )));
            }
            if !committee.verify(*index, digest.as_bytes(), signature) {
                return Err(TypesError::InvalidTransaction(format!(
                    "bad signature from member {index}"
                )));
            }
        }

        if seen.len() < committee.quorum() {
            return Err(TypesError::InvalidTransaction(format!(
                "{} signatures below quorum {}",
                seen.len(),
                committee.quorum()
            )));
        }
        Ok(())
    }
}
