//! Consensus metrics.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Counters and gauges describing round progress.
#[derive(Debug, Clone, Default)]
pub struct ConsensusMetrics {
    /// Solid state index of the current round.
    pub state_index: Gauge,
    /// Rounds started.
    pub rounds_started: Counter,
    /// Rounds whose transaction was confirmed.
    pub rounds_completed: Counter,
    /// Rounds aborted by an execution failure.
    pub rounds_aborted: Counter,
    /// Rounds given up after rejection or deadline.
    pub rounds_abandoned: Counter,
    /// Partial signatures accepted.
    pub signatures_accepted: Counter,
    /// Partial signatures rejected.
    pub signatures_rejected: Counter,
    /// Transaction posts, including retries.
    pub transactions_posted: Counter,
}

impl ConsensusMetrics {
    /// Registers all metrics under the `keel_consensus` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("keel_consensus");
        registry.register(
            "state_index",
            "Solid state index of the current round",
            self.state_index.clone(),
        );
        registry.register("rounds_started", "Rounds started", self.rounds_started.clone());
        registry.register(
            "rounds_completed",
            "Rounds whose transaction was confirmed",
            self.rounds_completed.clone(),
        );
        registry.register(
            "rounds_aborted",
            "Rounds aborted by an execution failure",
            self.rounds_aborted.clone(),
        );
        registry.register(
            "rounds_abandoned",
            "Rounds abandoned after rejection or deadline",
            self.rounds_abandoned.clone(),
        );
        registry.register(
            "signatures_accepted",
            "Partial signatures accepted",
            self.signatures_accepted.clone(),
        );
        registry.register(
            "signatures_rejected",
            "Partial signatures rejected",
            self.signatures_rejected.clone(),
        );
        registry.register(
            "transactions_posted",
            "Anchor transaction posts including retries",
            self.transactions_posted.clone(),
        );
    }
}
