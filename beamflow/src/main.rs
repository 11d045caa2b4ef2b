//! beamflow: queue-driven image to 3D asset pipeline.
//!
//! `work` consumes the task queue and runs stages, `watch` uploads finished
//! outputs. Run any number of each against the same work root and sentinel
//! directory.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use beamflow::config::{BeamflowConfig, ConfigOverrides};
use beamflow::coordinator::{Producer, ProducerSettings, Watcher, WatcherSettings};
use beamflow::core::TaskMessage;
use beamflow::events::LoggingEventSink;
use beamflow::observability::{init_logging, LogFormat};
use beamflow::queue::{MessageQueue, QueueConsumer, SpoolQueue};
use beamflow::render::HttpRenderInvoker;
use beamflow::sentinel::FileSentinelStore;
use beamflow::stages::StageRunner;
use beamflow::storage::BlobStore;

#[derive(Parser, Debug)]
#[command(name = "beamflow", version, about = "Image to 3D asset pipeline coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "BEAMFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true, env = "BEAMFLOW_LOG_LEVEL")]
    log_level: String,

    /// Log format (text or json)
    #[arg(long, default_value = "text", global = true, env = "BEAMFLOW_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: OverrideArgs,
}

#[derive(clap::Args, Debug)]
struct OverrideArgs {
    /// Object store URL (gs://bucket, file:///dir, memory://)
    #[arg(long, global = true, env = "BEAMFLOW_STORAGE_URL")]
    storage_url: Option<String>,

    /// Render service endpoint
    #[arg(long, global = true, env = "BEAMFLOW_RENDER_ENDPOINT")]
    render_endpoint: Option<String>,

    /// Spool directory of the task queue
    #[arg(long, global = true, env = "BEAMFLOW_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Sentinel directory
    #[arg(long, global = true, env = "BEAMFLOW_SENTINEL_DIR")]
    sentinel_dir: Option<PathBuf>,

    /// Root of per-task working directories
    #[arg(long, global = true, env = "BEAMFLOW_WORK_ROOT")]
    work_root: Option<PathBuf>,

    /// Maximum concurrently processed tasks
    #[arg(long, global = true, env = "BEAMFLOW_MAX_IN_FLIGHT")]
    max_in_flight: Option<usize>,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            storage_url: args.storage_url,
            render_endpoint: args.render_endpoint,
            spool_dir: args.spool_dir,
            sentinel_dir: args.sentinel_dir,
            work_root: args.work_root,
            max_in_flight: args.max_in_flight,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume the task queue and run the stages of each task
    Work,
    /// Take handoff sentinels and upload finished outputs
    Watch,
    /// Publish one task message to the queue
    Enqueue {
        /// Base file name of the image
        #[arg(long)]
        filename: String,
        /// Object store location, e.g. gs://bucket/fullbodyimages/a.png
        #[arg(long)]
        storage_path: String,
    },
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    let config = match &cli.config {
        Some(path) => BeamflowConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BeamflowConfig::default(),
    }
    .with_overrides(&cli.overrides.into());

    match cli.command {
        Commands::Work => work(config).await,
        Commands::Watch => watch(config).await,
        Commands::Enqueue {
            filename,
            storage_path,
        } => enqueue(&config, filename, storage_path).await,
        Commands::Check => {
            config.validate()?;
            info!(stages = config.stages.len(), "Configuration is valid");
            Ok(())
        }
    }
}

async fn work(config: BeamflowConfig) -> anyhow::Result<()> {
    config.validate()?;

    let store = Arc::new(BlobStore::for_url(&config.storage.url)?);
    let sentinels = Arc::new(FileSentinelStore::create(&config.sentinel.dir).await?);
    let queue = Arc::new(SpoolQueue::open(&config.queue.spool_dir, config.queue.redelivery).await?);

    let recovered = queue.recover_stale(config.queue.visibility_timeout()).await?;
    if recovered > 0 {
        warn!(recovered, "Requeued deliveries abandoned by a previous worker");
    }

    let events = Arc::new(LoggingEventSink::default());
    let mut producer = Producer::new(
        store,
        sentinels,
        config.stages.clone(),
        ProducerSettings::from_config(&config),
    )
    .with_runner(StageRunner::new())
    .with_event_sink(events.clone());
    if let Some(endpoint) = &config.render.endpoint {
        let invoker = HttpRenderInvoker::new(endpoint.clone(), config.render.timeout())?
            .with_expect_glb(config.render.expect_glb);
        producer = producer.with_render_invoker(Arc::new(invoker));
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(
        storage = %config.storage.url,
        spool = %config.queue.spool_dir.display(),
        stages = config.stages.len(),
        "beamflow worker starting"
    );
    let consumer = QueueConsumer::new(queue, config.queue.consumer_config())
        .with_filter(config.intake.clone())
        .with_event_sink(events);
    let stats = consumer.consume(Arc::new(producer), shutdown).await;

    info!("Worker stopped");
    info!("  Succeeded: {}", stats.succeeded);
    info!("  Retried: {}", stats.retried);
    info!("  Fatal: {}", stats.fatal);
    info!("  Malformed: {}", stats.malformed);
    info!("  Dead-lettered: {}", stats.dead_lettered);
    info!("  Deferred: {}", stats.deferred);
    info!("  Filtered: {}", stats.filtered);
    Ok(())
}

async fn watch(config: BeamflowConfig) -> anyhow::Result<()> {
    let store = Arc::new(BlobStore::for_url(&config.storage.url)?);
    let sentinels = Arc::new(FileSentinelStore::create(&config.sentinel.dir).await?);
    let watcher = Watcher::new(store, sentinels, WatcherSettings::from_config(&config))
        .with_event_sink(Arc::new(LoggingEventSink::default()));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(
        storage = %config.storage.url,
        sentinels = %config.sentinel.dir.display(),
        "beamflow watcher starting"
    );
    watcher.run(shutdown).await;
    Ok(())
}

async fn enqueue(config: &BeamflowConfig, filename: String, storage_path: String) -> anyhow::Result<()> {
    let queue = SpoolQueue::open(&config.queue.spool_dir, config.queue.redelivery).await?;
    let body = serde_json::to_vec(&TaskMessage::new(filename, storage_path))?;
    let id = queue.publish(&body).await?;
    info!(id = %id, "Task enqueued");
    println!("{id}");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    shutdown_signal().await;
    info!("Shutdown requested, finishing in-flight work");
    shutdown.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
    }
}
