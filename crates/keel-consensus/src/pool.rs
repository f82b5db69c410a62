//! Request pool for pending requests.
//!
//! The pool holds requests observed on the ledger that no confirmed block has
//! processed yet. Proposals draw from it in request id order so that members
//! holding the same requests propose the same batch.

use crate::error::{ConsensusError, Result};
use crate::ports::{Mempool, MempoolStats};
use keel_types::{Request, RequestId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Configuration for the request pool.
#[derive(Debug, Clone)]
pub struct RequestPoolConfig {
    /// Maximum number of requests held.
    pub max_requests: usize,

    /// Maximum request age before eviction.
    pub max_request_age: Duration,
}

impl Default for RequestPoolConfig {
    fn default() -> Self {
        Self {
            max_requests: 10_000,
            max_request_age: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request: Request,
    added_at: Instant,
    propose_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    requests: BTreeMap<RequestId, PendingRequest>,
    /// Arrival order, for capacity eviction.
    arrival: VecDeque<RequestId>,
}

/// The request pool.
#[derive(Debug)]
pub struct RequestPool {
    config: RequestPoolConfig,
    inner: RwLock<Inner>,
}

impl RequestPool {
    /// Creates a new pool with the given configuration.
    pub fn new(config: RequestPoolConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Creates a new pool with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RequestPoolConfig::default())
    }

    /// Adds a request, evicting the oldest arrivals when full.
    pub fn add(&self, request: Request) -> Result<RequestId> {
        let id = request.id;
        let mut inner = self.inner.write();

        if inner.requests.contains_key(&id) {
            return Err(ConsensusError::DuplicateRequest(id));
        }

        while inner.requests.len() >= self.config.max_requests {
            let Some(old_id) = inner.arrival.pop_front() else {
                break;
            };
            inner.requests.remove(&old_id);
            tracing::debug!(request = %old_id, "evicted request due to pool capacity");
        }

        inner.requests.insert(
            id,
            PendingRequest {
                request,
                added_at: Instant::now(),
                propose_count: 0,
            },
        );
        inner.arrival.push_back(id);
        tracing::trace!(request = %id, "added request to pool");
        Ok(id)
    }

    /// Whether the pool holds `id`.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.read().requests.contains_key(id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.inner.read().requests.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().requests.is_empty()
    }
}

impl Mempool for RequestPool {
    fn stats(&self) -> MempoolStats {
        let inner = self.inner.read();
        let now = Instant::now();

        let mut oldest = Duration::ZERO;
        let mut total_propose_count = 0u64;
        for pending in inner.requests.values() {
            oldest = oldest.max(now.duration_since(pending.added_at));
            total_propose_count += pending.propose_count as u64;
        }

        MempoolStats {
            request_count: inner.requests.len(),
            oldest_request_age: oldest,
            average_propose_count: if inner.requests.is_empty() {
                0.0
            } else {
                total_propose_count as f64 / inner.requests.len() as f64
            },
        }
    }

    fn ready_requests(&self, max: usize) -> Vec<Request> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let mut result = Vec::with_capacity(max.min(inner.requests.len()));
        for pending in inner.requests.values_mut() {
            if result.len() >= max {
                break;
            }
            if now.duration_since(pending.added_at) > self.config.max_request_age {
                continue;
            }
            pending.propose_count += 1;
            result.push(pending.request.clone());
        }
        result
    }

    fn get_requests(&self, ids: &[RequestId]) -> (Vec<Request>, Vec<RequestId>) {
        let inner = self.inner.read();
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match inner.requests.get(id) {
                Some(p) => found.push(p.request.clone()),
                None => missing.push(*id),
            }
        }
        (found, missing)
    }

    fn remove_requests(&self, ids: &[RequestId]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let before = inner.requests.len();
        for id in ids {
            inner.requests.remove(id);
        }
        let Inner { requests, arrival } = &mut *inner;
        arrival.retain(|id| requests.contains_key(id));
        tracing::debug!(removed = before - requests.len(), "removed processed requests");
    }

    fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let expired: HashSet<RequestId> = inner
            .requests
            .iter()
            .filter(|(_, p)| now.duration_since(p.added_at) > self.config.max_request_age)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        inner.requests.retain(|id, _| !expired.contains(id));
        inner.arrival.retain(|id| !expired.contains(id));
        tracing::debug!(removed = expired.len(), "reaped expired requests");
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{HashValue, TransactionId};

    fn request(n: u32) -> Request {
        let id = RequestId::new(TransactionId(HashValue::digest(&n.to_be_bytes())), 0);
        Request::new(id, format!("call-{n}"), n as u64)
    }

    #[test]
    fn test_pool_add_and_duplicate() {
        let pool = RequestPool::with_defaults();
        let req = request(1);
        let id = pool.add(req.clone()).unwrap();
        assert!(pool.contains(&id));
        assert!(matches!(
            pool.add(req),
            Err(ConsensusError::DuplicateRequest(dup)) if dup == id
        ));
    }

    #[test]
    fn test_pool_capacity_evicts_oldest_arrival() {
        let pool = RequestPool::new(RequestPoolConfig {
            max_requests: 3,
            ..Default::default()
        });
        for i in 1..=5 {
            pool.add(request(i)).unwrap();
        }
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&request(1).id));
        assert!(!pool.contains(&request(2).id));
        assert!(pool.contains(&request(5).id));
    }

    #[test]
    fn test_ready_requests_sorted_and_bounded() {
        let pool = RequestPool::with_defaults();
        for i in (1..=6).rev() {
            pool.add(request(i)).unwrap();
        }
        let ready = pool.ready_requests(4);
        assert_eq!(ready.len(), 4);
        let ids: Vec<_> = ready.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        // Same content, same selection.
        let again: Vec<_> = pool.ready_requests(4).iter().map(|r| r.id).collect();
        assert_eq!(ids, again);
        assert!(pool.stats().average_propose_count > 0.0);
    }

    #[test]
    fn test_get_requests_reports_missing() {
        let pool = RequestPool::with_defaults();
        pool.add(request(1)).unwrap();
        let (found, missing) = pool.get_requests(&[request(1).id, request(2).id]);
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![request(2).id]);
    }

    #[test]
    fn test_remove_requests() {
        let pool = RequestPool::with_defaults();
        for i in 1..=5 {
            pool.add(request(i)).unwrap();
        }
        pool.remove_requests(&[request(1).id, request(3).id, request(9).id]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stats().request_count, 3);
    }

    #[test]
    fn test_reap_expired() {
        let pool = RequestPool::new(RequestPoolConfig {
            max_request_age: Duration::ZERO,
            ..Default::default()
        });
        pool.add(request(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.ready_requests(10).is_empty());
        assert_eq!(pool.reap_expired(), 1);
        assert!(pool.is_empty());
    }
}
