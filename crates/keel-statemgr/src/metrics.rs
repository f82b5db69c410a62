//! State manager metrics.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Counters and gauges describing state manager progress.
#[derive(Debug, Clone, Default)]
pub struct StateManagerMetrics {
    /// Current solid state index.
    pub solid_state_index: Gauge,
    /// Largest state index evidenced by peers or the ledger.
    pub evidenced_state_index: Gauge,
    /// Candidates registered (including merged duplicates).
    pub candidates_registered: Counter,
    /// Candidates approved by an anchor output.
    pub candidates_approved: Counter,
    /// Conflicts between candidates and anchor outputs.
    pub conflicts: Counter,
    /// Block requests sent to peers.
    pub sync_requests: Counter,
}

impl StateManagerMetrics {
    /// Registers all metrics under the `keel_statemgr` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("keel_statemgr");
        registry.register(
            "solid_state_index",
            "Current solid state index",
            self.solid_state_index.clone(),
        );
        registry.register(
            "evidenced_state_index",
            "Largest state index evidenced by peers or the ledger",
            self.evidenced_state_index.clone(),
        );
        registry.register(
            "candidates_registered",
            "Candidate blocks registered",
            self.candidates_registered.clone(),
        );
        registry.register(
            "candidates_approved",
            "Candidate blocks approved by an anchor output",
            self.candidates_approved.clone(),
        );
        registry.register(
            "conflicts",
            "Conflicts between candidate blocks and anchor outputs",
            self.conflicts.clone(),
        );
        registry.register(
            "sync_requests",
            "Block requests sent to peers",
            self.sync_requests.clone(),
        );
    }
}
