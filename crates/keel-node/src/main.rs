//! keel node - committee member for keel chains.

use anyhow::Context;
use clap::{Parser, Subcommand};
use keel_node::observability::{init_logging, LogFormat, NodeMetrics};
use keel_node::{Devnet, NodeConfig};
use std::path::PathBuf;
use std::time::Duration;

/// keel node - smart contract chains run by validator committees
#[derive(Parser, Debug)]
#[command(name = "keel-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process committee and push requests through it
    Devnet {
        /// Committee size
        #[arg(long)]
        committee_size: Option<usize>,

        /// Number of requests to submit
        #[arg(long)]
        requests: Option<usize>,

        /// Print metrics when done
        #[arg(long)]
        metrics: bool,
    },
    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    match args.command {
        Command::CheckConfig => {
            let yaml = serde_yaml::to_string(&config).context("failed to render config")?;
            print!("{yaml}");
            Ok(())
        }
        Command::Devnet {
            committee_size,
            requests,
            metrics,
        } => {
            if let Some(size) = committee_size {
                config.devnet.committee_size = size;
            }
            if let Some(requests) = requests {
                config.devnet.requests = requests;
            }
            config.validate().context("invalid config")?;
            init_logging(
                &config.log_level,
                LogFormat::parse(&config.log_format).is_json(),
            );
            run_devnet(config, metrics).await
        }
    }
}

async fn run_devnet(config: NodeConfig, print_metrics: bool) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting keel devnet");

    let metrics = NodeMetrics::new();
    let mut devnet = Devnet::start(&config, &metrics)
        .await
        .context("failed to start devnet")?;

    let interval = Duration::from_millis(config.devnet.request_interval_ms);
    let total = config.devnet.requests;
    let driver = async {
        for n in 0..total {
            devnet.submit(format!("key{n}=value{n}"));
            tokio::time::sleep(interval).await;
        }
        devnet
            .wait_for_processed(total, Duration::from_millis(config.devnet.timeout_ms))
            .await
    };

    let completed = tokio::select! {
        done = driver => done,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            false
        }
    };

    let anchor = devnet.ledger().anchor();
    tracing::info!(
        state_index = anchor.state_index,
        processed = devnet.ledger().processed_count(),
        submitted = total,
        completed,
        "devnet finished"
    );
    for handle in devnet.handles() {
        let state = handle.state_status();
        let consensus = handle.consensus_status();
        tracing::info!(
            member = handle.own_index(),
            solid_index = state.solid_index,
            solid_hash = %state.solid_hash.short(),
            phase = ?consensus.phase,
            pending = consensus.mempool.request_count,
            "member status"
        );
    }
    if print_metrics {
        print!("{}", metrics.render().context("failed to render metrics")?);
    }
    devnet.shutdown().await;

    if !completed {
        anyhow::bail!("devnet did not process all {total} requests");
    }
    Ok(())
}
