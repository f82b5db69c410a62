//! Committee membership.
//!
//! A committee is the fixed validator set running one chain instance. The
//! consensus engine only relies on the [`Committee`] trait; [`StaticCommittee`]
//! is the in-process implementation backed by Ed25519 keys.

use crate::{MemberIndex, Result, Signature, SigningKey, TypesError, VerificationKey};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked once when a committee is dismissed.
pub type DismissHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns the smallest quorum tolerating `(n - 1) / 3` faulty members.
pub fn default_quorum(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    size - (size - 1) / 3
}

/// The validator set of one chain instance, as seen by a single member.
pub trait Committee: Send + Sync {
    /// Number of members.
    fn size(&self) -> usize;

    /// Signatures required to finalize a round.
    fn quorum(&self) -> usize;

    /// Index of the local member.
    fn own_index(&self) -> MemberIndex;

    /// Whether connections to enough peers are established to start work.
    fn is_ready(&self) -> bool;

    /// Verification key of a member, if the index is in range.
    fn member_key(&self, index: MemberIndex) -> Option<VerificationKey>;

    /// Signs a message with the local member key.
    fn sign(&self, msg: &[u8]) -> Signature;

    /// Terminates the whole chain instance. Irreversible.
    fn dismiss(&self, reason: &str);

    /// Whether [`Committee::dismiss`] has been called.
    fn is_dismissed(&self) -> bool;

    /// All member indices except our own.
    fn peers(&self) -> Vec<MemberIndex> {
        let own = self.own_index();
        (0..self.size() as MemberIndex)
            .filter(|i| *i != own)
            .collect()
    }

    /// Verifies a member signature. Out-of-range indices never verify.
    fn verify(&self, index: MemberIndex, msg: &[u8], signature: &Signature) -> bool {
        match self.member_key(index) {
            Some(key) => key.verify(signature, msg).is_ok(),
            None => false,
        }
    }
}

/// A committee with a fixed member list known up front.
pub struct StaticCommittee {
    members: Vec<VerificationKey>,
    own_index: MemberIndex,
    signing_key: SigningKey,
    quorum: usize,
    ready: AtomicBool,
    dismissed: AtomicBool,
    on_dismiss: Option<DismissHook>,
}

impl StaticCommittee {
    /// Creates a committee.
    ///
    /// `quorum` defaults to [`default_quorum`] when `None`. Fails when the
    /// local key does not match the member at `own_index` or the quorum is
    /// not in `1..=size`.
    pub fn new(
        members: Vec<VerificationKey>,
        own_index: MemberIndex,
        signing_key: SigningKey,
        quorum: Option<usize>,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(TypesError::InvalidCommittee("no members".into()));
        }
        let own = members.get(own_index as usize).ok_or_else(|| {
            TypesError::InvalidCommittee(format!(
                "own index {own_index} out of range for {} members",
                members.len()
            ))
        })?;
        if *own != signing_key.verification_key() {
            return Err(TypesError::InvalidCommittee(
                "signing key does not match own member key".into(),
            ));
        }
        let quorum = quorum.unwrap_or_else(|| default_quorum(members.len()));
        if quorum == 0 || quorum > members.len() {
            return Err(TypesError::InvalidCommittee(format!(
                "quorum {quorum} not in 1..={}",
                members.len()
            )));
        }

        Ok(Self {
            members,
            own_index,
            signing_key,
            quorum,
            ready: AtomicBool::new(true),
            dismissed: AtomicBool::new(false),
            on_dismiss: None,
        })
    }

    /// Installs a callback run when the committee is dismissed.
    pub fn with_dismiss_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_dismiss = Some(Arc::new(hook));
        self
    }

    /// Updates readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl fmt::Debug for StaticCommittee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCommittee")
            .field("size", &self.members.len())
            .field("own_index", &self.own_index)
            .field("quorum", &self.quorum)
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .field("dismissed", &self.dismissed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Committee for StaticCommittee {
    fn size(&self) -> usize {
        self.members.len()
    }

    fn quorum(&self) -> usize {
        self.quorum
    }

    fn own_index(&self) -> MemberIndex {
        self.own_index
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_dismissed()
    }

    fn member_key(&self, index: MemberIndex) -> Option<VerificationKey> {
        self.members.get(index as usize).copied()
    }

    fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    fn dismiss(&self, reason: &str) {
        if self.dismissed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(own_index = self.own_index, reason, "committee dismissed");
        if let Some(hook) = &self.on_dismiss {
            hook(reason);
        }
    }

    fn is_dismissed(&self) -> bool {
        self.dismissed.load(Ordering::SeqCst)
    }
}

impl<T: Committee + ?Sized> Committee for Arc<T> {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn quorum(&self) -> usize {
        (**self).quorum()
    }

    fn own_index(&self) -> MemberIndex {
        (**self).own_index()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn member_key(&self, index: MemberIndex) -> Option<VerificationKey> {
        (**self).member_key(index)
    }

    fn sign(&self, msg: &[u8]) -> Signature {
        (**self).sign(msg)
    }

    fn dismiss(&self, reason: &str) {
        (**self).dismiss(reason)
    }

    fn is_dismissed(&self) -> bool {
        (**self).is_dismissed()
    }
}
