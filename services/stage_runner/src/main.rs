//! Stage runner entry point
//!
//! Reads newline-delimited JSON records from stdin, processes them through
//! one configured stage and writes result records to stdout. Logs go to
//! stderr so stdout stays a clean record stream.

use anyhow::{bail, Context};
use clap::Parser;
use stage_runner::run;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transform_stage::config::ENV_PREFIX;
use transform_stage::{
    Collaborator, ConnectionPool, LineCollaborator, StageFactory, StagesConfig, TcpCollaborator,
    TcpConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stages configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Name of the stage to run
    #[arg(short, long)]
    stage: String,

    /// Where write stages send their output: `stdout` or `tcp://host:port`
    #[arg(short, long, default_value = "stdout")]
    output: String,

    /// Prefix for environment overrides, e.g. STAGES__<stage>__<option>
    #[arg(long, default_value = ENV_PREFIX)]
    env_prefix: String,

    /// Records processed concurrently
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Size of the shared connection pool
    #[arg(long, default_value_t = 8)]
    pool_size: usize,

    /// Retries for the TCP collaborator
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// TCP connect timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!("Starting stage runner");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = StagesConfig::load_with_prefix(&args.config, &args.env_prefix)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate()?;

    let results = Arc::new(LineCollaborator::new("stdout", tokio::io::stdout()));
    let collaborator: Arc<dyn Collaborator> = match args.output.strip_prefix("tcp://") {
        Some(address) => Arc::new(TcpCollaborator::new(
            address,
            TcpConfig {
                max_retries: args.max_retries,
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
                ..TcpConfig::default()
            },
        )),
        None if args.output == "stdout" => results.clone(),
        None => bail!("Unsupported output '{}': expected stdout or tcp://host:port", args.output),
    };

    let pool = Arc::new(ConnectionPool::new("shared", args.pool_size));
    let factory = StageFactory::new(collaborator.clone(), pool);
    let stage = factory.build_named(&config, &args.stage)?;

    info!(
        "Running stage '{}' with concurrency {} (output: {})",
        args.stage, args.concurrency, args.output
    );

    let input = BufReader::new(tokio::io::stdin());
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = run(stage.clone(), input, results.as_ref(), args.concurrency) => {
            let summary = result?;
            info!(
                "Input exhausted: {} records, {} accepted, {} emitted, {} rejected, {} malformed",
                summary.records, summary.accepted, summary.emitted, summary.rejected, summary.malformed
            );
        }
        _ = shutdown_signal => {
            info!("Shutting down stage runner");
        }
    }

    let metadata = stage.metadata();
    info!(
        "Stage '{}' ({}): processed={} rejected={} last_error={:?}",
        metadata.name,
        metadata.stage_type,
        metadata.records_processed,
        metadata.records_rejected,
        metadata.last_error
    );
    let collaborator = collaborator.metadata();
    info!(
        "Collaborator '{}': writes_ok={} writes_failed={}",
        collaborator.name, collaborator.writes_ok, collaborator.writes_failed
    );

    Ok(())
}
