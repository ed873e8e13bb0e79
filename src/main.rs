//! TLS-terminating echo server.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────┐
//!                     │                  TLS ECHO SERVER                  │
//!                     │                                                   │
//!   Client            │  ┌──────────┐   ┌───────────┐   ┌─────────────┐   │
//!   ──────────────────┼─▶│ listener │──▶│ handshake │──▶│  pipeline   │   │
//!                     │  │admission │   │   (TLS)   │   │ read/write  │   │
//!                     │  └────┬─────┘   └─────┬─────┘   └──────┬──────┘   │
//!   ◀─────────────────┼───────┼───────────────┼────────────────┘          │
//!                     │       ▼               ▼                           │
//!                     │  ┌────────────────────────────────────────────┐   │
//!                     │  │ registry: active ids, counter, buffers     │   │
//!                     │  └────────────────────────────────────────────┘   │
//!                     │  reactor: N workers sharing one tokio runtime     │
//!                     └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use tls_echo_server::config::{self, PipelineMode, ServerConfig};
use tls_echo_server::lifecycle::signals::wait_for_termination;
use tls_echo_server::observability::{logging, metrics};
use tls_echo_server::TlsServer;

#[derive(Parser)]
#[command(name = "tls-echo-server")]
#[command(about = "TLS-terminating TCP echo server", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Reactor worker threads (overrides the config file)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Pipeline mode: echo or aggregate (overrides the config file)
    #[arg(long)]
    pipeline: Option<PipelineMode>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(threads) = cli.threads {
        config.server.worker_threads = threads;
    }
    if let Some(pipeline) = cli.pipeline {
        config.server.pipeline = pipeline;
    }
    config::validation::validate_config(&config).map_err(config::ConfigError::Validation)?;

    logging::init(&config.observability);

    tracing::info!(
        port = config.server.port,
        workers = config.server.effective_worker_threads(),
        max_connections = config.server.max_connections,
        pipeline = ?config.server.pipeline,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut server = TlsServer::new(config);
    server.start()?;

    let control = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    control.block_on(wait_for_termination())?;

    server.shutdown();
    Ok(())
}
