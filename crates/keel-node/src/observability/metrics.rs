//! Prometheus metrics collection.
//!
//! The node owns one registry. Every chain instance registers its state
//! manager and consensus metrics under a `member` label, so an in-process
//! committee can share the registry.

use keel_consensus::ConsensusMetrics;
use keel_statemgr::StateManagerMetrics;
use keel_types::MemberIndex;
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::borrow::Cow;
use std::sync::Arc;

/// Metrics state container.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Chain instances started.
    pub chains_started: Counter,
    /// Chain instances whose bootstrap failed.
    pub bootstrap_failures: Counter,
    /// Chain instances currently running.
    pub chains_running: Gauge,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    /// Create a new metrics state with the node metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let chains_started = Counter::default();
        registry.register(
            "keel_chains_started",
            "Chain instances started",
            chains_started.clone(),
        );

        let bootstrap_failures = Counter::default();
        registry.register(
            "keel_bootstrap_failures",
            "Chain instances whose state bootstrap failed",
            bootstrap_failures.clone(),
        );

        let chains_running = Gauge::default();
        registry.register(
            "keel_chains_running",
            "Chain instances currently running",
            chains_running.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            chains_started,
            bootstrap_failures,
            chains_running,
        }
    }

    /// Registers the component metrics of one chain instance.
    pub fn register_chain(
        &self,
        member: MemberIndex,
        consensus: &ConsensusMetrics,
        state_manager: &StateManagerMetrics,
    ) {
        let mut registry = self.registry.write();
        let labelled = registry.sub_registry_with_label((
            Cow::Borrowed("member"),
            Cow::Owned(member.to_string()),
        ));
        consensus.register(labelled);
        state_manager.register(labelled);
    }

    /// Encode all metrics in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry.read())?;
        Ok(buffer)
    }
}
