//! Logging and metrics for a keel node.
//!
//! ```rust,no_run
//! use keel_node::observability::{init_logging, NodeMetrics};
//!
//! init_logging("info", false);
//! let metrics = NodeMetrics::new();
//! println!("{}", metrics.render().unwrap());
//! ```

mod logging;
mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
