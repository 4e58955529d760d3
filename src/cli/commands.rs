//! CLI command definitions for envforge.
//!
//! This module provides the command-line interface for building environments,
//! running stage workers and inspecting the effective configuration.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::config::Settings;
use crate::logging::ContextLogger;
use crate::pipeline::{EnvironmentModel, PipelineCoordinator, RunDescriptor, RunState, StageRunner};
use crate::registry::RegistryVersionResolver;
use crate::scheduler::{MemoryQueue, RedisQueue, StageQueue, WorkerPool, WorkerPoolConfig};
use crate::storage::ArtifactStore;

/// Reproducible software environment builder.
#[derive(Parser)]
#[command(name = "envforge")]
#[command(about = "Build, version and publish reproducible software environments")]
#[command(version)]
#[command(
    long_about = "envforge builds software environments with spack and singularity, publishes the\nimage to the configured registries and renders a module file for it.\n\nExample usage:\n  envforge environment build --name users/alice/tools tools.yml --wait"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Settings file (defaults to ~/.softpack/builder/config.yml when present).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Redis URL of a shared stage queue. Without it stages run in-process.
    #[arg(long, env = "ENVFORGE_QUEUE_URL", global = true)]
    pub queue_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Manage environments.
    #[command(alias = "env")]
    Environment(EnvironmentArgs),

    /// Run a stage worker pool against the shared queue.
    Worker(WorkerArgs),

    /// Inspect configuration.
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct EnvironmentArgs {
    #[command(subcommand)]
    pub command: EnvironmentSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum EnvironmentSubcommand {
    /// Build an environment from a spec file with `description` and `packages`.
    Build(BuildArgs),
}

/// Arguments for `envforge environment build`.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Environment name, e.g. users/alice/tools.
    #[arg(short, long)]
    pub name: String,

    /// Environment spec file.
    pub spec: PathBuf,

    /// Print the final status once the run finishes.
    #[arg(short, long)]
    pub wait: bool,
}

/// Arguments for `envforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (defaults to queue.workers).
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Requeue jobs left in the processing list by a crashed worker before starting.
    #[arg(long)]
    pub recover: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective settings with secrets redacted.
    Show,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(cli.config.as_ref(), cli.queue_url)?;
    match cli.command {
        Commands::Environment(args) => match args.command {
            EnvironmentSubcommand::Build(args) => run_build_command(settings, args).await,
        },
        Commands::Worker(args) => run_worker_command(settings, args).await,
        Commands::Config(args) => match args.command {
            ConfigSubcommand::Show => {
                print!("{}", serde_yaml::to_string(&settings.redacted())?);
                Ok(())
            }
        },
    }
}

fn load_settings(path: Option<&PathBuf>, queue_url: Option<String>) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(path.map(|p| p.as_path()))?;
    if let Some(url) = queue_url.filter(|u| !u.trim().is_empty()) {
        settings.queue.url = Some(url);
    }
    Ok(settings)
}

async fn connect_queue(settings: &Settings) -> anyhow::Result<Arc<dyn StageQueue>> {
    match settings.queue.url {
        Some(ref url) => {
            let queue = RedisQueue::connect(url, &settings.queue.name)
                .await
                .map_err(|e| anyhow::anyhow!("Cannot reach stage queue at {}: {}", url, e))?;
            Ok(Arc::new(queue))
        }
        None => Ok(Arc::new(MemoryQueue::new())),
    }
}

/// Builds a worker pool running pipeline stages from `queue`.
fn stage_worker_pool(
    settings: &Arc<Settings>,
    queue: Arc<dyn StageQueue>,
    logger: Arc<ContextLogger>,
    workers: usize,
) -> WorkerPool {
    let runner = StageRunner::new(
        Arc::clone(settings),
        logger,
        Arc::new(ArtifactStore::new(&settings.artifacts.path)),
        RegistryVersionResolver::http(),
    );
    WorkerPool::new(
        WorkerPoolConfig::new(workers).with_poll_interval(settings.queue.poll_interval()),
        queue,
        Arc::new(runner),
    )
}

fn print_status(descriptor: &RunDescriptor) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&descriptor.status())?);
    Ok(())
}

// ============================================================================
// Build Command Implementation
// ============================================================================

async fn run_build_command(settings: Settings, args: BuildArgs) -> anyhow::Result<()> {
    let model = EnvironmentModel::from_yaml_file(&args.spec)?;
    let settings = Arc::new(settings);
    let queue = connect_queue(&settings).await?;
    let logger = Arc::new(ContextLogger::new(Arc::clone(&settings)));

    // Without a shared queue nobody else runs the stages.
    let mut local_pool = if settings.queue.url.is_none() {
        let mut pool = stage_worker_pool(
            &settings,
            Arc::clone(&queue),
            Arc::clone(&logger),
            settings.queue.workers,
        );
        pool.start()?;
        Some(pool)
    } else {
        None
    };

    let coordinator = PipelineCoordinator::new(Arc::clone(&settings), queue, logger);
    let descriptor = coordinator.submit(&args.name, model).await?;
    print_status(&descriptor)?;

    // The coordinator lives in this process, so the run is driven to the end
    // either way.
    let finished = coordinator
        .wait(descriptor.id, settings.queue.poll_interval())
        .await?;

    if let Some(ref mut pool) = local_pool {
        pool.shutdown().await?;
    }

    if args.wait {
        print_status(&finished)?;
    }
    if finished.state == RunState::Failed {
        let reason = finished
            .failure
            .map(|f| f.message)
            .unwrap_or_else(|| "unknown failure".to_string());
        return Err(anyhow::anyhow!("Build of {} failed: {}", finished.name, reason));
    }
    info!(run_id = %finished.id, version = ?finished.image_version, "Environment built");
    Ok(())
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

async fn run_worker_command(settings: Settings, args: WorkerArgs) -> anyhow::Result<()> {
    let Some(ref url) = settings.queue.url else {
        return Err(anyhow::anyhow!(
            "A shared queue is required; pass --queue-url or set ENVFORGE_QUEUE_URL"
        ));
    };
    let redis = RedisQueue::connect(url, &settings.queue.name).await?;
    if args.recover {
        let recovered = redis.recover_processing_jobs().await?;
        if recovered > 0 {
            warn!(recovered, "Requeued unfinished stage jobs");
        }
    }

    let workers = args.workers.unwrap_or(settings.queue.workers).max(1);
    let settings = Arc::new(settings);
    let logger = Arc::new(ContextLogger::new(Arc::clone(&settings)));
    let mut pool = stage_worker_pool(&settings, Arc::new(redis), logger, workers);
    pool.start()?;
    info!(workers, queue = %settings.queue.name, "Waiting for stage jobs (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        average_ms = stats.average_job_duration.as_millis() as u64,
        success_rate = stats.success_rate(),
        "Worker pool stopped"
    );
    Ok(())
}
