//! Partial signature collection for quorum.

use crate::error::{ConsensusError, Result};
use keel_types::{Committee, HashValue, MemberIndex, Signature};

/// Result of adding a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collected {
    /// Stored; quorum not yet reached.
    Added {
        /// Signatures held now.
        count: usize,
    },
    /// Stored and the quorum is now complete.
    QuorumReached,
    /// Quorum was already complete; the signature was not looked at.
    Ignored,
}

/// Collects one partial signature per committee member over a fixed message.
///
/// The buffer is sized to the committee. Collection stops at exactly the
/// quorum threshold.
#[derive(Debug, Clone)]
pub struct SignatureCollector {
    message: HashValue,
    quorum: usize,
    slots: Vec<Option<Signature>>,
    count: usize,
}

impl SignatureCollector {
    /// Creates a collector for `message` over a committee of `size`.
    pub fn new(message: HashValue, size: usize, quorum: usize) -> Self {
        Self {
            message,
            quorum,
            slots: vec![None; size],
            count: 0,
        }
    }

    /// The signed message.
    pub fn message(&self) -> HashValue {
        self.message
    }

    /// Adds `signature` from member `index`.
    ///
    /// Indices outside the committee, a second signature from one member and
    /// signatures that fail verification are rejected.
    pub fn add(
        &mut self,
        committee: &dyn Committee,
        index: MemberIndex,
        signature: Signature,
    ) -> Result<Collected> {
        if self.has_quorum() {
            return Ok(Collected::Ignored);
        }
        let size = self.slots.len();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(ConsensusError::SignerOutOfRange { index, size })?;
        if slot.is_some() {
            return Err(ConsensusError::DuplicateSignature(index));
        }
        if !committee.verify(index, self.message.as_bytes(), &signature) {
            return Err(ConsensusError::InvalidSignature(format!(
                "member {index} over {}",
                self.message.short()
            )));
        }
        *slot = Some(signature);
        self.count += 1;

        if self.has_quorum() {
            Ok(Collected::QuorumReached)
        } else {
            Ok(Collected::Added { count: self.count })
        }
    }

    /// Number of signatures held.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the quorum is complete.
    pub fn has_quorum(&self) -> bool {
        self.count >= self.quorum
    }

    /// Collected signatures in member order.
    pub fn signatures(&self) -> Vec<(MemberIndex, Signature)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|sig| (i as MemberIndex, sig)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{SigningKey, StaticCommittee};

    fn setup(n: usize) -> (Vec<SigningKey>, StaticCommittee) {
        let keys: Vec<SigningKey> = (0..n).map(|i| SigningKey::from([i as u8 + 1; 32])).collect();
        let members = keys.iter().map(|k| k.verification_key()).collect();
        let committee = StaticCommittee::new(members, 0, keys[0].clone(), None).unwrap();
        (keys, committee)
    }

    #[test]
    fn test_quorum_is_exact() {
        let (keys, committee) = setup(4);
        let msg = HashValue::digest(b"essence");
        let mut collector = SignatureCollector::new(msg, 4, committee.quorum());
        assert_eq!(committee.quorum(), 3);

        let sign = |i: usize| keys[i].sign(msg.as_bytes());
        assert_eq!(
            collector.add(&committee, 0, sign(0)).unwrap(),
            Collected::Added { count: 1 }
        );
        assert_eq!(
            collector.add(&committee, 2, sign(2)).unwrap(),
            Collected::Added { count: 2 }
        );
        assert!(!collector.has_quorum());
        assert_eq!(collector.add(&committee, 1, sign(1)).unwrap(), Collected::QuorumReached);

        // Later arrivals are ignored.
        assert_eq!(collector.add(&committee, 3, sign(3)).unwrap(), Collected::Ignored);
        let sigs = collector.signatures();
        assert_eq!(sigs.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let (keys, committee) = setup(4);
        let msg = HashValue::digest(b"essence");
        let mut collector = SignatureCollector::new(msg, 4, 3);

        assert!(matches!(
            collector.add(&committee, 4, keys[0].sign(msg.as_bytes())),
            Err(ConsensusError::SignerOutOfRange { index: 4, size: 4 })
        ));
        assert!(matches!(
            collector.add(&committee, 1, keys[2].sign(msg.as_bytes())),
            Err(ConsensusError::InvalidSignature(_))
        ));
        assert!(matches!(
            collector.add(&committee, 1, keys[1].sign(b"other")),
            Err(ConsensusError::InvalidSignature(_))
        ));

        collector.add(&committee, 1, keys[1].sign(msg.as_bytes())).unwrap();
        assert!(matches!(
            collector.add(&committee, 1, keys[1].sign(msg.as_bytes())),
            Err(ConsensusError::DuplicateSignature(1))
        ));
        assert_eq!(collector.count(), 1);
    }
}
