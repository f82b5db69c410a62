//! # keel node
//!
//! Runs committee members of keel chains. A member of one chain is a
//! [`chain::ChainInstance`]: a state manager and a consensus engine wired to
//! each other and to the ledger, the agreement primitive and the peer
//! network.
//!
//! ## Modules
//!
//! - [`config`]: YAML and environment configuration
//! - [`observability`]: logging and Prometheus metrics
//! - [`chain`]: chain instance wiring
//! - [`devnet`]: an in-process committee over an in-memory ledger

pub mod chain;
pub mod config;
pub mod devnet;
mod error;
pub mod observability;

pub use chain::{ChainHandle, ChainInstance, ChainPorts};
pub use config::NodeConfig;
pub use devnet::Devnet;
pub use error::{NodeError, Result};
