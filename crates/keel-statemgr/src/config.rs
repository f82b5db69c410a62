//! State manager configuration.

use std::time::Duration;

/// Configuration for the state manager.
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// How long to wait for a peer to answer a block request.
    pub sync_timeout: Duration,

    /// How often to ask the ledger for the current anchor output.
    pub pull_state_interval: Duration,

    /// Size of the mailbox channel.
    pub mailbox_size: usize,

    /// Timer tick driving retries and sync.
    pub timer_tick: Duration,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(1),
            pull_state_interval: Duration::from_secs(10),
            mailbox_size: 1024,
            timer_tick: Duration::from_millis(100),
        }
    }
}
