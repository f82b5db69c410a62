//! Node configuration.
//!
//! Loaded from an optional YAML file, then overridden by `KEEL__*`
//! environment variables (`KEEL__CONSENSUS__MAX_BATCH=50`). Durations are
//! given in milliseconds.

use crate::error::{NodeError, Result};
use keel_consensus::ConsensusConfig;
use keel_statemgr::StateManagerConfig;
use keel_types::{HashValue, SigningKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KEEL";

/// Storage backend for chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Keep everything in memory.
    #[default]
    Memory,
    /// RocksDB under `data_dir`.
    Rocksdb,
}

/// Configuration for a keel node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (pretty, json).
    pub log_format: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Storage backend.
    pub storage: StorageBackend,
    /// Consensus engine settings.
    pub consensus: ConsensusSection,
    /// State manager settings.
    pub state_manager: StateManagerSection,
    /// In-process committee settings.
    pub devnet: DevnetSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            data_dir: PathBuf::from("./data"),
            storage: StorageBackend::Memory,
            consensus: ConsensusSection::default(),
            state_manager: StateManagerSection::default(),
            devnet: DevnetSection::default(),
        }
    }
}

/// Consensus settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// Delay before proposing a batch.
    pub proposal_delay_ms: u64,
    /// Delay before executing an agreed batch.
    pub execution_delay_ms: u64,
    /// How long a finalized transaction is re-posted.
    pub post_deadline_ms: u64,
    /// Interval between re-posts.
    pub post_retry_ms: u64,
    /// Interval between inclusion polls.
    pub inclusion_poll_interval_ms: u64,
    /// How long to wait for inclusion.
    pub inclusion_deadline_ms: u64,
    /// Maximum requests per proposal.
    pub max_batch: usize,
    /// Minimum ready requests before proposing.
    pub min_batch: usize,
    /// Quorum override; defaults to tolerating a third of faulty members.
    pub quorum: Option<usize>,
    /// Mailbox size.
    pub mailbox_size: usize,
    /// Timer tick.
    pub timer_tick_ms: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

impl From<&ConsensusConfig> for ConsensusSection {
    fn from(c: &ConsensusConfig) -> Self {
        Self {
            proposal_delay_ms: millis(c.proposal_delay),
            execution_delay_ms: millis(c.execution_delay),
            post_deadline_ms: millis(c.post_deadline),
            post_retry_ms: millis(c.post_retry),
            inclusion_poll_interval_ms: millis(c.inclusion_poll_interval),
            inclusion_deadline_ms: millis(c.inclusion_deadline),
            max_batch: c.max_batch,
            min_batch: c.min_batch,
            quorum: None,
            mailbox_size: c.mailbox_size,
            timer_tick_ms: millis(c.timer_tick),
        }
    }
}

impl ConsensusSection {
    /// Engine configuration.
    pub fn to_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            proposal_delay: Duration::from_millis(self.proposal_delay_ms),
            execution_delay: Duration::from_millis(self.execution_delay_ms),
            post_deadline: Duration::from_millis(self.post_deadline_ms),
            post_retry: Duration::from_millis(self.post_retry_ms),
            inclusion_poll_interval: Duration::from_millis(self.inclusion_poll_interval_ms),
            inclusion_deadline: Duration::from_millis(self.inclusion_deadline_ms),
            max_batch: self.max_batch,
            min_batch: self.min_batch,
            mailbox_size: self.mailbox_size,
            timer_tick: Duration::from_millis(self.timer_tick_ms),
        }
    }
}

/// State manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StateManagerSection {
    /// How long to wait for one peer's block.
    pub sync_timeout_ms: u64,
    /// How often to pull the anchor output from the ledger.
    pub pull_state_interval_ms: u64,
    /// Mailbox size.
    pub mailbox_size: usize,
    /// Timer tick.
    pub timer_tick_ms: u64,
}

impl Default for StateManagerSection {
    fn default() -> Self {
        let c = StateManagerConfig::default();
        Self {
            sync_timeout_ms: millis(c.sync_timeout),
            pull_state_interval_ms: millis(c.pull_state_interval),
            mailbox_size: c.mailbox_size,
            timer_tick_ms: millis(c.timer_tick),
        }
    }
}

impl StateManagerSection {
    /// State manager configuration.
    pub fn to_config(&self) -> StateManagerConfig {
        StateManagerConfig {
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            pull_state_interval: Duration::from_millis(self.pull_state_interval_ms),
            mailbox_size: self.mailbox_size,
            timer_tick: Duration::from_millis(self.timer_tick_ms),
        }
    }
}

/// In-process committee settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DevnetSection {
    /// Number of committee members.
    pub committee_size: usize,
    /// Requests submitted by the driver.
    pub requests: usize,
    /// Interval between submitted requests.
    pub request_interval_ms: u64,
    /// Give up waiting for the requests after this long.
    pub timeout_ms: u64,
    /// Chain name the chain address is derived from.
    pub chain: String,
    /// Hex seed member keys are derived from.
    pub key_seed: String,
}

impl Default for DevnetSection {
    fn default() -> Self {
        Self {
            committee_size: 4,
            requests: 10,
            request_interval_ms: 200,
            timeout_ms: 30_000,
            chain: "devnet".to_string(),
            key_seed: hex::encode([7u8; 32]),
        }
    }
}

impl DevnetSection {
    /// Member signing keys, derived from the seed.
    pub fn member_keys(&self) -> Result<Vec<SigningKey>> {
        let seed = hex::decode(&self.key_seed)
            .map_err(|e| NodeError::InvalidConfig(format!("devnet.key_seed: {e}")))?;
        Ok((0..self.committee_size as u16)
            .map(|i| {
                let digest = HashValue::digest_parts(&[seed.as_slice(), &i.to_be_bytes()]);
                SigningKey::from(*digest.as_bytes())
            })
            .collect())
    }
}

impl NodeConfig {
    /// Loads the configuration from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.consensus;
        let durations = [
            ("consensus.post_deadline_ms", c.post_deadline_ms),
            ("consensus.post_retry_ms", c.post_retry_ms),
            ("consensus.inclusion_poll_interval_ms", c.inclusion_poll_interval_ms),
            ("consensus.inclusion_deadline_ms", c.inclusion_deadline_ms),
            ("consensus.timer_tick_ms", c.timer_tick_ms),
            ("state_manager.sync_timeout_ms", self.state_manager.sync_timeout_ms),
            ("state_manager.pull_state_interval_ms", self.state_manager.pull_state_interval_ms),
            ("state_manager.timer_tick_ms", self.state_manager.timer_tick_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(NodeError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if c.mailbox_size == 0 || self.state_manager.mailbox_size == 0 {
            return Err(NodeError::InvalidConfig("mailbox sizes must be positive".into()));
        }
        if c.max_batch == 0 {
            return Err(NodeError::InvalidConfig("consensus.max_batch must be positive".into()));
        }
        if c.min_batch > c.max_batch {
            return Err(NodeError::InvalidConfig(format!(
                "consensus.min_batch {} exceeds max_batch {}",
                c.min_batch, c.max_batch
            )));
        }
        if self.devnet.committee_size == 0 {
            return Err(NodeError::InvalidConfig("devnet.committee_size must be positive".into()));
        }
        if let Some(quorum) = c.quorum {
            if quorum == 0 || quorum > self.devnet.committee_size {
                return Err(NodeError::InvalidConfig(format!(
                    "consensus.quorum {quorum} not in 1..={}",
                    self.devnet.committee_size
                )));
            }
        }
        if hex::decode(&self.devnet.key_seed).is_err() {
            return Err(NodeError::InvalidConfig("devnet.key_seed is not hex".into()));
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.consensus.to_config().max_batch, ConsensusConfig::default().max_batch);
        assert_eq!(
            config.state_manager.to_config().pull_state_interval,
            StateManagerConfig::default().pull_state_interval
        );
    }

    #[test]
    fn test_rejects_zero_duration() {
        let mut config = NodeConfig::default();
        config.consensus.post_retry_ms = 0;
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_quorum_above_committee() {
        let mut config = NodeConfig::default();
        config.consensus.quorum = Some(5);
        assert!(config.validate().is_err());
        config.consensus.quorum = Some(4);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_min_batch_above_max() {
        let mut config = NodeConfig::default();
        config.consensus.min_batch = 10;
        config.consensus.max_batch = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "log_level: debug\nstorage: rocksdb\nconsensus:\n  max_batch: 7\n  proposal_delay_ms: 20\ndevnet:\n  committee_size: 7"
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage, StorageBackend::Rocksdb);
        assert_eq!(config.consensus.max_batch, 7);
        assert_eq!(config.consensus.to_config().proposal_delay, Duration::from_millis(20));
        // Unset fields keep their defaults.
        assert_eq!(config.consensus.min_batch, 1);
        assert_eq!(config.devnet.committee_size, 7);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "consensus:\n  timer_tick_ms: 0").unwrap();
        assert!(matches!(
            NodeConfig::load(Some(file.path())),
            Err(NodeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_member_keys_are_deterministic() {
        let section = DevnetSection::default();
        let a = section.member_keys().unwrap();
        let b = section.member_keys().unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a[2].verification_key(), b[2].verification_key());
        assert_ne!(a[0].verification_key(), a[1].verification_key());
    }
}
