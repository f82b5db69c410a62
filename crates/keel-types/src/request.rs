//! Requests to the chain.

use crate::RequestId;
use serde::{Deserialize, Serialize};

/// A request waiting to be processed by the chain.
///
/// The payload is opaque to the committee; only the VM runner interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Request identifier.
    pub id: RequestId,
    /// Opaque call data.
    pub payload: Vec<u8>,
    /// When the request was observed on the ledger (unix milliseconds).
    pub timestamp_ms: u64,
}

impl Request {
    /// Creates a new request.
    pub fn new(id: RequestId, payload: impl Into<Vec<u8>>, timestamp_ms: u64) -> Self {
        Self {
            id,
            payload: payload.into(),
            timestamp_ms,
        }
    }
}
