//! fieldlink gateway daemon
//!
//! Reads sensor frames, decodes them, and delivers the records to the
//! collection server, spooling to disk while the server is unreachable.
//!
//! # Usage
//!
//! ```bash
//! # RFM radio bridge on a serial line
//! fieldlink --source rfm:/dev/ttyAMA0
//!
//! # Radio bridge plus plug-meter payloads piped from the mesh coordinator
//! mesh-bridge | fieldlink --source rfm:/dev/ttyAMA0 --source plug:-
//!
//! # Sources listed under [[sources]] in the config file
//! fieldlink --config /etc/fieldlink/fieldlink.toml
//!
//! # No source anywhere: replay the spool until Ctrl+C
//! fieldlink --config /etc/fieldlink/spool-only.toml
//! ```
//!
//! # Environment Variables
//!
//! - `FIELDLINK_CONFIG`: Path to the TOML config (default: ./fieldlink.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use fieldlink::acquisition::{run_producer, FrameDecoder, FrameSource, LineSource, PlugDecoder, RfmDecoder};
use fieldlink::config::{self, GatewayConfig, SourceConfig, SourceFormat};
use fieldlink::{DeliveryChannel, DeliverySettings, DiskSpool, Reporter, ReporterTimings, TlsConnector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Upper bound on waiting for tasks to spool and exit after shutdown
const SHUTDOWN_GRACE_SECS: u64 = 30;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(about = "Field gateway reliable delivery client")]
#[command(version)]
struct CliArgs {
    /// Path to the gateway config (overrides FIELDLINK_CONFIG and ./fieldlink.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the collection server host
    #[arg(long)]
    host: Option<String>,

    /// Override the collection server port
    #[arg(long)]
    port: Option<u16>,

    /// Override the spool directory
    #[arg(long, value_name = "DIR")]
    spool_dir: Option<PathBuf>,

    /// Frame source as FORMAT:PATH (rfm or plug; PATH "-" is stdin).
    /// Repeatable; replaces the config's [[sources]] when given.
    #[arg(long = "source", value_name = "FORMAT:PATH")]
    sources: Vec<SourceConfig>,

    /// Also write daily-rotated log files into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Reporter,
    Producer,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Reporter => write!(f, "Reporter"),
            TaskName::Producer => write!(f, "Producer"),
        }
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Console logging, plus a non-blocking daily file when `log_dir` is set.
/// The returned guard must live until exit or buffered lines are lost.
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fieldlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

fn load_config(args: &CliArgs) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GatewayConfig::load(),
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = &args.spool_dir {
        config.spool.dir = dir.clone();
    }
    if !args.sources.is_empty() {
        config.sources = args.sources.clone();
    }
    config.validate().context("Invalid configuration after CLI overrides")?;

    for warning in config::validation::validate_operational_ranges(&config) {
        warn!("{}", warning);
    }
    Ok(config)
}

// ============================================================================
// Task Spawning
// ============================================================================

fn spawn_producer<S: FrameSource, D: FrameDecoder + 'static>(
    task_set: &mut JoinSet<Result<TaskName>>,
    source: S,
    decoder: D,
    sender: UnboundedSender<fieldlink::MeasurementRecord>,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        // A dead source must not take the reporter down with it
        if let Err(e) = run_producer(source, decoder, sender, cancel_token).await {
            error!(error = %format!("{e:#}"), "Producer gave up on its source");
        }
        Ok(TaskName::Producer)
    });
}

fn spawn_decoder<S: FrameSource>(
    task_set: &mut JoinSet<Result<TaskName>>,
    source: S,
    format: SourceFormat,
    config: &GatewayConfig,
    sender: UnboundedSender<fieldlink::MeasurementRecord>,
    cancel_token: CancellationToken,
) -> Result<()> {
    match format {
        SourceFormat::Rfm => {
            let decoder = RfmDecoder::from_config(&config.decoder).context("Invalid RFM node table")?;
            if decoder.node_count() == 0 {
                warn!("No RFM nodes configured ([[decoder.nodes]]); every frame will be rejected");
            }
            spawn_producer(task_set, source, decoder, sender, cancel_token);
        }
        SourceFormat::Plug => {
            let decoder = PlugDecoder::from_config(&config.mesh).context("Invalid plug meter list")?;
            if decoder.registered_count() == 0 {
                warn!("No plug meters registered ([mesh] plugmeters); every frame will be rejected");
            }
            spawn_producer(task_set, source, decoder, sender, cancel_token);
        }
    }
    Ok(())
}

/// Open one configured source and start its producer.
async fn spawn_source(
    task_set: &mut JoinSet<Result<TaskName>>,
    source: &SourceConfig,
    config: &GatewayConfig,
    sender: UnboundedSender<fieldlink::MeasurementRecord>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!(path = %source.path.display(), format = ?source.format, "Input source");
    if source.is_stdin() {
        spawn_decoder(task_set, LineSource::stdin(), source.format, config, sender, cancel_token)
    } else {
        let line_source = LineSource::open(&source.path).await?;
        spawn_decoder(task_set, line_source, source.format, config, sender, cancel_token)
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Monitor tasks; cancel everything when one fails.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Supervisor: task completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Let cancelled tasks finish spooling before the process exits.
async fn drain_tasks(task_set: &mut JoinSet<Result<TaskName>>) {
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(task_name)) => info!(task = %task_name, "Task stopped"),
                Ok(Err(e)) => warn!(error = %e, "Task stopped with error"),
                Err(e) => warn!(error = %e, "Task panicked during shutdown"),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE_SECS, "Tasks still running after grace period, aborting");
        task_set.abort_all();
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref())?;

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!(
        server = %config.server.address(),
        spool = %config.spool.dir.display(),
        window = config.delivery.window_size,
        ack_timeout_ms = config.delivery.ack_timeout_ms,
        "fieldlink starting"
    );

    let spool = DiskSpool::open(&config.spool.dir)
        .with_context(|| format!("Failed to open spool {}", config.spool.dir.display()))?;
    let connector = TlsConnector::from_config(&config).context("Failed to build TLS client")?;
    let channel = DeliveryChannel::new(connector, DeliverySettings::from(&config.delivery));

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let (sender, receiver) = mpsc::unbounded_channel();
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Sources open before the reporter starts, so a bad path fails fast
    if config.sources.is_empty() {
        info!("No frame source configured; delivering spooled records only");
    }
    for source in &config.sources {
        spawn_source(&mut task_set, source, &config, sender.clone(), cancel_token.clone()).await?;
    }
    // Producers hold the remaining senders; the live channel closes when the last one stops
    drop(sender);

    let reporter = Reporter::new(
        channel,
        receiver,
        spool,
        ReporterTimings::from(&config.reporter),
        cancel_token.clone(),
    );
    task_set.spawn(async move {
        let stats = reporter.run().await;
        info!(
            batches_sent = stats.channel.batches_sent,
            acks = stats.channel.acks_received,
            spooled = stats.spooled,
            "Delivery summary"
        );
        Ok(TaskName::Reporter)
    });

    let result = run_supervisor(&mut task_set, cancel_token.clone()).await;
    cancel_token.cancel();
    drain_tasks(&mut task_set).await;

    info!("fieldlink shutdown complete");
    result
}
