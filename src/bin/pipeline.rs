//! # Pipeline Process Runner
//!
//! One binary for every process role. Each role loads configuration, connects to the
//! broker with bounded retry, declares the topology and consumes its queues until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use pipeline_core::config::PipelineConfig;
use pipeline_core::constants::queues;
use pipeline_core::logging::{init_structured_logging, log_broker_operation, log_error};
use pipeline_core::messaging::{
    declare_topology, BrokerHandle, ConnectionManager, Consumer, ConsumerHandle, MessageHandler,
    ProgressNotifier, Publisher, RabbitMqConnector, StageNotifier, Topology,
};
use pipeline_core::orchestration::{
    DirectoryWorkspace, NotificationIntake, Orchestrator, RequestIntake,
};
use pipeline_core::stages::{
    CommandPreparer, CommandRenderer, Configurator, ExecutionWorker, TokioProcessRunner,
    VisualizationWorker,
};

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Message-driven scientific pipeline processes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Declare exchanges, queues and bindings, then exit
    InitTopology,
    /// Run the stage orchestrator (handler and notification queues)
    Orchestrator,
    /// Run the configurator (config queue)
    Configurator,
    /// Run the execution worker
    ExecutionWorker,
    /// Run the visualization worker
    VisualizationWorker,
}

impl Commands {
    fn role(&self) -> &'static str {
        match self {
            Self::InitTopology => "init-topology",
            Self::Orchestrator => "orchestrator",
            Self::Configurator => "configurator",
            Self::ExecutionWorker => "execution-worker",
            Self::VisualizationWorker => "visualization-worker",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let role = cli.command.role();
    info!(role, broker = %config.broker.redacted_uri(), "Starting pipeline process");

    if let Err(e) = run(cli.command, &config).await {
        log_error(role, "run", &format!("{:#}", e), None);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Commands, config: &PipelineConfig) -> Result<()> {
    let manager = ConnectionManager::new(
        RabbitMqConnector::new(config.broker.connection_params(command.role())),
        config.broker.retry_policy(),
    );
    let broker = manager.connect().await.context("connecting to broker")?;

    let topology = Topology::pipeline();
    declare_topology(&broker, &topology)
        .await
        .context("declaring topology")?;
    log_broker_operation("declare_topology", None, None, "ok", None);

    if let Commands::InitTopology = command {
        broker.close().await?;
        return Ok(());
    }

    let publisher = Arc::new(match config.broker.message_ttl() {
        Some(ttl) => Publisher::new(broker.clone(), ttl),
        None => Publisher::without_ttl(broker.clone()),
    });
    let consumer = Consumer::new(broker.clone(), config.broker.prefetch);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    let mut background = Vec::new();

    match command {
        Commands::InitTopology => {}
        Commands::Orchestrator => {
            let uploader = config
                .object_store
                .uploader(Arc::new(TokioProcessRunner::new()));
            if uploader.is_none() {
                warn!("Output delivery disabled; working directories are kept");
            }
            let workspace = DirectoryWorkspace::new(&config.orchestration.output_root)
                .keep_outputs(config.orchestration.keep_outputs || uploader.is_none());
            let mut orchestrator = Orchestrator::new(
                publisher.clone(),
                Arc::new(workspace),
                config.orchestration.settings(),
            );
            if let Some(uploader) = uploader {
                orchestrator = orchestrator.with_uploader(Arc::new(uploader));
            }
            let orchestrator = Arc::new(orchestrator);

            handles.push(
                subscribe(&consumer, queues::HANDLER, Arc::new(RequestIntake::new(orchestrator.clone())))
                    .await?,
            );
            handles.push(
                subscribe(
                    &consumer,
                    queues::NOTIFICATIONS,
                    Arc::new(NotificationIntake::new(orchestrator.clone())),
                )
                .await?,
            );
            background.push(tokio::spawn(
                orchestrator.run_reaper(config.orchestration.reaper_interval(), shutdown_rx.clone()),
            ));
        }
        Commands::Configurator => {
            let runner = Arc::new(TokioProcessRunner::new());
            let preparer = CommandPreparer::new(
                runner,
                config.stages.fetch_command.clone(),
                config.stages.adapt_command.clone(),
            );
            let configurator =
                Configurator::new(Arc::new(preparer), publisher.clone(), &config.stages.data_dir);
            handles.push(subscribe(&consumer, queues::CONFIG, Arc::new(configurator)).await?);
        }
        Commands::ExecutionWorker => {
            let worker = ExecutionWorker::new(
                Arc::new(TokioProcessRunner::new()),
                StageNotifier::new(publisher.clone()),
                ProgressNotifier::new(publisher.clone()),
                config.stages.execution_settings(),
            );
            handles.push(subscribe(&consumer, queues::EXECUTION_ALGORITHM, Arc::new(worker)).await?);
        }
        Commands::VisualizationWorker => {
            let renderer = CommandRenderer::new(
                Arc::new(TokioProcessRunner::new()),
                config.stages.render_command.clone(),
            );
            let worker = VisualizationWorker::new(
                Arc::new(renderer),
                StageNotifier::new(publisher.clone()),
                ProgressNotifier::new(publisher.clone()),
            )
            .with_pool(config.stages.max_render_workers);
            handles.push(
                subscribe(&consumer, queues::EXECUTION_VISUALIZATION, Arc::new(worker)).await?,
            );
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    shutdown(broker, handles).await;
    for task in background {
        if let Err(e) = task.await {
            error!(error = %e, "Background task failed");
        }
    }
    Ok(())
}

async fn subscribe(
    consumer: &Consumer,
    queue: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConsumerHandle> {
    let handle = consumer
        .subscribe(queue, handler)
        .await
        .with_context(|| format!("subscribing to {}", queue))?;
    log_broker_operation("subscribe", None, Some(queue), "ok", None);
    Ok(handle)
}

async fn shutdown(broker: BrokerHandle, handles: Vec<ConsumerHandle>) {
    for handle in handles {
        let queue = handle.queue().to_string();
        if let Err(e) = handle.shutdown().await {
            error!(queue = %queue, error = %e, "Consumer stopped with error");
        }
    }
    if let Err(e) = broker.close().await {
        error!(error = %e, "Closing broker connection failed");
    }
}
