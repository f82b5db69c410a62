//! Consensus configuration.

use std::time::Duration;

/// Configuration for the consensus engine.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Delay between receiving a state and proposing a batch.
    pub proposal_delay: Duration,

    /// Delay between agreeing on a batch and executing it.
    pub execution_delay: Duration,

    /// How long a finalized transaction is re-posted.
    pub post_deadline: Duration,

    /// Interval between re-posts.
    pub post_retry: Duration,

    /// Interval between inclusion polls.
    pub inclusion_poll_interval: Duration,

    /// How long to wait for inclusion before giving up on the round.
    pub inclusion_deadline: Duration,

    /// Maximum requests per proposal.
    pub max_batch: usize,

    /// Minimum ready requests before proposing.
    pub min_batch: usize,

    /// Size of the mailbox channel.
    pub mailbox_size: usize,

    /// Timer tick driving retries.
    pub timer_tick: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            proposal_delay: Duration::from_millis(500),
            execution_delay: Duration::ZERO,
            post_deadline: Duration::from_secs(10),
            post_retry: Duration::from_secs(2),
            inclusion_poll_interval: Duration::from_secs(1),
            inclusion_deadline: Duration::from_secs(30),
            max_batch: 100,
            min_batch: 1,
            mailbox_size: 1024,
            timer_tick: Duration::from_millis(100),
        }
    }
}
