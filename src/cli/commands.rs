//! CLI command definitions and wiring.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{build_router, AppState};
use crate::autoscaler::{AutoscalerController, InMemoryPoolManager, WorkerPoolManager};
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchQueue, DispatchSink, Dispatcher, SubmitRequest};
use crate::job::JobType;
use crate::metrics;
use crate::monitor::HeartbeatMonitor;
use crate::store::{JobStore, PostgresJobStore};
use crate::sweeper::CleanupSweeper;

/// Job orchestration and autoscaling engine for audio processing pipelines.
#[derive(Parser)]
#[command(name = "waveflow")]
#[command(about = "Job orchestration and autoscaling for audio processing pipelines")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the engine: HTTP API, heartbeat monitor, cleanup sweeper,
    /// autoscaler.
    Serve,

    /// Submit a job directly against the store and dispatch queue.
    Submit(SubmitArgs),

    /// Show a single job.
    Status(JobIdArgs),

    /// Cancel a pending or running job.
    Cancel(JobIdArgs),

    /// Aggregate job statistics.
    Stats,
}

/// Arguments for `waveflow submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Worker class (analysis, generation, training).
    #[arg(short = 't', long)]
    pub job_type: String,

    /// Identifier of the resource to process.
    #[arg(short, long)]
    pub entity_id: String,

    /// Request parameters as a JSON object.
    #[arg(short, long, default_value = "null")]
    pub params: String,
}

/// Arguments for commands addressing one job.
#[derive(Parser, Debug)]
pub struct JobIdArgs {
    /// Job id.
    pub id: Uuid,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the selected command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Submit(args) => submit(config, args).await,
        Commands::Status(args) => status(config, args).await,
        Commands::Cancel(args) => cancel(config, args).await,
        Commands::Stats => stats(config).await,
    }
}

async fn connect_store(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let store = PostgresJobStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}

async fn connect_dispatcher(
    config: &OrchestratorConfig,
    store: Arc<dyn JobStore>,
) -> anyhow::Result<Dispatcher> {
    let queue = DispatchQueue::connect(&config.redis_url, &config.queue_prefix).await?;
    let sink: Arc<dyn DispatchSink> = Arc::new(queue);
    Ok(Dispatcher::new(store, sink, config.dispatcher.clone()))
}

async fn serve(config: OrchestratorConfig) -> anyhow::Result<()> {
    metrics::init_metrics()?;

    let store = connect_store(&config).await?;

    let queue = DispatchQueue::connect(&config.redis_url, &config.queue_prefix).await?;
    // Messages stuck in a processing list belong to workers that died
    // between dequeue and claim; put them back in flight.
    for class in JobType::ALL {
        match queue.recover_processing(class).await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(class = %class, recovered, "Recovered in-flight dispatch messages");
            }
            Err(e) => {
                warn!(class = %class, error = %e, "Could not recover processing queue");
            }
        }
    }
    let sink: Arc<dyn DispatchSink> = Arc::new(queue);
    let dispatcher = Dispatcher::new(store.clone(), sink, config.dispatcher.clone());

    let pool: Arc<dyn WorkerPoolManager> =
        Arc::new(InMemoryPoolManager::new(config.initial_replicas));
    let autoscaler = Arc::new(AutoscalerController::new(
        store.clone(),
        pool,
        config.autoscaler.clone(),
    )?);

    // Background loops share one shutdown channel; each runs independently
    // against the store.
    let (shutdown_tx, _) = broadcast::channel(1);

    let monitor = HeartbeatMonitor::new(dispatcher.clone(), config.monitor.clone());
    tokio::spawn(monitor.run(shutdown_tx.subscribe()));

    let sweeper = CleanupSweeper::new(store.clone(), config.sweeper.clone());
    tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    tokio::spawn(Arc::clone(&autoscaler).run(shutdown_tx.subscribe()));

    let state = AppState {
        dispatcher,
        store,
        autoscaler,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

async fn submit(config: OrchestratorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let job_type: JobType = args
        .job_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let params: serde_json::Value = serde_json::from_str(&args.params)?;

    let store = connect_store(&config).await?;
    let dispatcher = connect_dispatcher(&config, store).await?;

    let receipt = dispatcher
        .submit(SubmitRequest::new(job_type, args.entity_id, params))
        .await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    // Hand-off runs on a background task; give it a moment to reach the
    // queue before this one-shot process exits.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    Ok(())
}

async fn status(config: OrchestratorConfig, args: JobIdArgs) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let job = store.get(args.id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cancel(config: OrchestratorConfig, args: JobIdArgs) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let job = store.cancel(args.id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn stats(config: OrchestratorConfig) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let stats = store.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
