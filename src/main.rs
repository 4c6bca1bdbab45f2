use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use swarm_engine::context::InMemoryContextStore;
use swarm_engine::core::config::Config;
use swarm_engine::database::{FileHistoryLog, FileRoutineCatalog};
use swarm_engine::events::BroadcastEventSink;
use swarm_engine::navigation::{Navigator, NavigatorRegistry};
use swarm_engine::queue::{
    InMemoryTaskLockManager, InMemoryTaskQueue, QueueWorker, TaskPayload, TaskQueue, TaskStatus,
};
use swarm_engine::reasoning::create_service;
use swarm_engine::strategies::ActionRegistry;
use swarm_engine::swarm::{coordinator, SwarmCoordinator, SwarmReport, SwarmState};

#[derive(Parser)]
#[clap(author, version, about = "Three-tier execution engine for cooperating agent swarms")]
struct Cli {
    /// Path to config file
    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Debug mode
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule one swarm and drive it to completion
    Run {
        /// What the swarm should achieve
        goal: String,

        /// Routine directory, overriding `storage.routines_dir`
        #[clap(short, long)]
        routines: Option<PathBuf>,

        /// Requester identity recorded on the task
        #[clap(long, default_value = "cli")]
        requester: String,

        /// Schedule with premium priority
        #[clap(long)]
        premium: bool,

        /// Channel that receives swarm events
        #[clap(long)]
        channel: Option<String>,
    },

    /// Check that a routine file parses and report which navigator runs it
    InspectRoutine {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if Path::new(&cli.config).exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::new().filter_level(log_level).init();

    if !Path::new(&cli.config).exists() {
        warn!("Config file {} not found, using defaults", cli.config);
    }

    match cli.command {
        Command::Run {
            goal,
            routines,
            requester,
            premium,
            channel,
        } => {
            let report = run(config, goal, routines, requester, premium, channel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.final_state == SwarmState::Failed {
                bail!("swarm {} failed", report.swarm_id);
            }
            Ok(())
        }
        Command::InspectRoutine { path } => inspect(&path).await,
    }
}

async fn run(
    config: Config,
    goal: String,
    routines: Option<PathBuf>,
    requester: String,
    premium: bool,
    channel: Option<String>,
) -> Result<SwarmReport> {
    let routines_dir = routines.unwrap_or_else(|| PathBuf::from(&config.storage.routines_dir));
    let catalog = FileRoutineCatalog::load(&routines_dir)
        .await
        .with_context(|| format!("Failed to load routines from {:?}", routines_dir))?;

    let data_dir = PathBuf::from(&config.storage.data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    let history = FileHistoryLog::open(data_dir.join(&config.storage.history_file))
        .await
        .context("Failed to open run history")?;

    let reasoning = create_service(&config.reasoning).context("Failed to set up reasoning")?;
    let sink = Arc::new(BroadcastEventSink::new(config.events.broadcast_capacity));
    let mut events = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                "[{}] {:?} for swarm {}: {}",
                event.channel_id, event.kind, event.swarm_id, event.payload
            );
        }
    });

    let coordinator = coordinator::init(SwarmCoordinator::build(
        &config,
        reasoning,
        ActionRegistry::with_builtins(),
        Arc::new(catalog),
        Arc::new(history),
        Arc::new(InMemoryContextStore::new()),
        sink,
    ))?;

    let shutdown = CancellationToken::new();
    let sweeper = coordinator
        .allocator()
        .clone()
        .spawn_sweeper(config.allocator.sweep_interval_ms, shutdown.clone());

    let queue = Arc::new(InMemoryTaskQueue::new(
        Arc::new(InMemoryTaskLockManager::new()),
        config.queue.clone(),
    ));
    let task_id = queue
        .schedule(TaskPayload::Swarm { goal, channel_id: channel }, &requester, premium)
        .await?;
    let worker = QueueWorker::new("worker-1", queue.clone(), coordinator.clone(), &config.queue);

    let processing = tokio::spawn(async move { worker.process_one().await });
    tokio::pin!(processing);
    let processed = tokio::select! {
        result = &mut processing => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling active swarms");
            for swarm_id in coordinator.active_swarms().await {
                if let Err(e) = coordinator.cancel_swarm(&swarm_id).await {
                    warn!("Could not cancel swarm {}: {}", swarm_id, e);
                }
            }
            processing.await
        }
    };
    processed.context("Worker task panicked")??;

    shutdown.cancel();
    sweeper.await.context("Lease sweeper panicked")?;
    coordinator::reset();

    let task = queue.get(task_id).await?;
    match (task.status, task.result) {
        (TaskStatus::Completed, Some(result)) => {
            serde_json::from_value(result).context("Malformed swarm report")
        }
        (status, _) => bail!(
            "task {} ended {}: {}",
            task_id,
            status,
            task.error.unwrap_or_default()
        ),
    }
}

async fn inspect(path: &Path) -> Result<()> {
    let routine = FileRoutineCatalog::read_file(path)
        .await
        .with_context(|| format!("Failed to read routine {:?}", path))?;
    let navigators = NavigatorRegistry::default();
    let navigator = navigators.validate(&routine)?;

    let start = navigator.start_location(&routine, "inspect")?;
    println!(
        "{} v{} ({}): navigated by {}, starts at '{}'",
        routine.id,
        routine.version,
        routine.name,
        navigator.name(),
        start.node_id
    );
    Ok(())
}
