//! FreshSync worker binary.
//!
//! Reads the pipeline descriptor table, spawns one supervised pipeline
//! per `(view, sink)` pair, and serves health probes until shutdown.
//!
//! Exit codes: 0 normal, 1 fatal configuration error, 2 when every
//! pipeline halted and an unrecoverable upstream schema error was among
//! the causes.

mod config;
mod orchestrator;
mod probes;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;

/// FreshSync — realtime view synchronization worker.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pipeline descriptor file (`view,sink,key_column[,shape_id]` lines).
    #[arg(long, env = "PIPELINE_DESCRIPTORS", default_value = "pipelines.conf")]
    descriptors: PathBuf,

    /// Listen address for the /ready and /live probes.
    #[arg(long, env = "PROBE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    probe_addr: String,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("freshsync={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting FreshSync worker");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    info!(descriptors = %args.descriptors.display(), "loading configuration");

    let config = match ServerConfig::load(&args.descriptors) {
        Ok(config) => config,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "configuration error");
            std::process::exit(1);
        }
    };
    info!(pipelines = config.descriptors.len(), "configuration loaded");

    let orchestrator = match Orchestrator::start(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let probe_server = match probes::serve(&args.probe_addr, orchestrator.statuses()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "probe endpoint failed to bind");
            std::process::exit(1);
        }
    };

    let exit_code = orchestrator.run().await;
    probe_server.abort();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
