use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use tmengine::config::EngineConfig;
use tmengine::execution::{BackendFactory, NativeModules};
use tmengine::image::JsonImageReader;
use tmengine::steps::{default_registry, image_analysis, ImageAnalysisStep};
use tmengine::storage::InMemoryExperimentStore;
use tmengine::subprocess::SubprocessManager;
use tmengine::workflow::{
    CollectJob, JobRunner, LocalSubmitter, RunJob, StepCommand, StepContext, WorkflowDescriptor,
    WorkflowStateMachine, WorkflowStep,
};

const EXPERIMENT_FILE: &str = "experiment.json";

/// Run microscopy image analysis workflows
#[derive(Parser)]
#[command(name = "tmengine", version)]
#[command(about = "Workflow engine for large scale microscopy image analysis", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv adds thread ids)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all steps of a workflow on an experiment
    Submit {
        experiment_dir: PathBuf,

        /// Workflow descriptor (default: <experiment_dir>/<name>.workflow or workflow.yaml)
        #[arg(short, long)]
        workflow: Option<PathBuf>,

        /// Path to configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Print the jobs a step command would submit and write their batch
    /// files, keeping results of previous runs
    Batches {
        experiment_dir: PathBuf,

        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Step command line
        #[arg(last = true, required = true)]
        step: Vec<String>,
    },
    /// Run a single job of a step
    Job {
        experiment_dir: PathBuf,

        /// Run job id
        #[arg(long, required_unless_present = "collect")]
        id: Option<usize>,

        /// Run the collect job instead of a run job
        #[arg(long, conflicts_with = "id")]
        collect: bool,

        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        #[arg(last = true, required = true)]
        step: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Submit { config, .. }
        | Commands::Batches { config, .. }
        | Commands::Job { config, .. } => config.clone(),
    };
    let experiment_dir = match &cli.command {
        Commands::Submit { experiment_dir, .. }
        | Commands::Batches { experiment_dir, .. }
        | Commands::Job { experiment_dir, .. } => experiment_dir.clone(),
    };
    let config = EngineConfig::load(&experiment_dir, config_path.as_deref());

    init_tracing(
        cli.verbose,
        config.as_ref().ok().and_then(|c| c.log_level.as_deref()),
    );
    debug!("tmengine started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match config {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: u8, configured: Option<&str>) {
    let level = match verbose {
        0 => configured.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .with_line_number(verbose >= 3)
        .init();
}

async fn run(command: Commands, config: EngineConfig) -> anyhow::Result<i32> {
    match command {
        Commands::Submit {
            experiment_dir,
            workflow,
            ..
        } => submit(&experiment_dir, workflow, &config).await,
        Commands::Batches {
            experiment_dir,
            step,
            ..
        } => print_batches(&experiment_dir, step, &config).await,
        Commands::Job {
            experiment_dir,
            id,
            collect,
            step,
            ..
        } => run_single_job(&experiment_dir, id, collect, step, &config).await,
    }
}

struct Experiment {
    dir: PathBuf,
    store: Arc<InMemoryExperimentStore>,
}

impl Experiment {
    async fn open(dir: &Path) -> anyhow::Result<Self> {
        let snapshot = dir.join(EXPERIMENT_FILE);
        let store = InMemoryExperimentStore::load(&snapshot)
            .await
            .with_context(|| format!("Failed to load experiment {}", snapshot.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            store: Arc::new(store),
        })
    }

    async fn save(&self) -> anyhow::Result<()> {
        let snapshot = self.dir.join(EXPERIMENT_FILE);
        self.store
            .save(&snapshot)
            .await
            .with_context(|| format!("Failed to save experiment {}", snapshot.display()))
    }

    fn context(&self, config: &EngineConfig) -> anyhow::Result<StepContext> {
        let backends = BackendFactory::new(
            Arc::new(NativeModules::new()),
            SubprocessManager::production(),
            config.interpreters()?,
        );
        Ok(StepContext {
            experiment_dir: self.dir.clone(),
            store: self.store.clone(),
            images: Arc::new(JsonImageReader::new(&self.dir)),
            backends,
            resources: config.resources.clone(),
            lock_dir: config.lock_dir(&self.dir),
        })
    }

    fn variables(&self) -> HashMap<String, String> {
        HashMap::from([(
            "experiment_dir".to_string(),
            self.dir.display().to_string(),
        )])
    }
}

/// `<experiment_dir>/<name>.workflow`, else `<experiment_dir>/workflow.yaml`
fn default_workflow_path(experiment_dir: &Path) -> PathBuf {
    let named = experiment_dir
        .file_name()
        .map(|name| experiment_dir.join(format!("{}.workflow", name.to_string_lossy())));
    match named {
        Some(path) if path.exists() => path,
        _ => experiment_dir.join("workflow.yaml"),
    }
}

async fn submit(
    experiment_dir: &Path,
    workflow: Option<PathBuf>,
    config: &EngineConfig,
) -> anyhow::Result<i32> {
    let experiment = Experiment::open(experiment_dir).await?;
    let workflow = workflow.unwrap_or_else(|| default_workflow_path(experiment_dir));
    let commands = WorkflowDescriptor::load(&workflow)?.commands(&experiment.variables())?;
    info!(
        "Submitting workflow {} with {} steps",
        workflow.display(),
        commands.len()
    );

    let mut machine = WorkflowStateMachine::new(
        commands,
        Arc::new(default_registry()),
        experiment.context(config)?,
        Arc::new(LocalSubmitter::new(config.max_parallel_jobs)),
    );

    let stop = machine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping workflow after the current step");
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let state = machine.run().await?;
    experiment.save().await?;

    if let Some(reason) = machine.last_error() {
        error!("Workflow {:?}: {}", state, reason);
    } else {
        info!("Workflow {:?}", state);
    }
    Ok(machine.exit_code())
}

fn step_command(words: Vec<String>) -> anyhow::Result<StepCommand> {
    Ok(StepCommand::from_words(words)?)
}

async fn print_batches(
    experiment_dir: &Path,
    words: Vec<String>,
    config: &EngineConfig,
) -> anyhow::Result<i32> {
    let experiment = Experiment::open(experiment_dir).await?;
    let command = step_command(words)?;
    let step = default_registry().create(&command, &experiment.context(config)?)?;
    let jobs = step.plan_jobs(step.batch_size()).await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(0)
}

async fn run_single_job(
    experiment_dir: &Path,
    id: Option<usize>,
    collect: bool,
    words: Vec<String>,
    config: &EngineConfig,
) -> anyhow::Result<i32> {
    let experiment = Experiment::open(experiment_dir).await?;
    let command = step_command(words)?;
    if command.program != image_analysis::PROGRAM {
        bail!("Step \"{}\" has no single job mode", command.program);
    }
    let step = ImageAnalysisStep::from_command(&command, &experiment.context(config)?)?;

    match id {
        Some(id) if !collect => {
            let batch = step.read_batch(id).await?;
            let job = RunJob {
                id,
                batch,
                resources: step.resources().clone(),
                arguments: std::env::args().collect(),
            };
            info!("Running job {} of step {}", id, step.name());
            step.run_job(&job).await?;
        }
        _ => {
            info!("Running collect job of step {}", step.name());
            step.collect(&CollectJob {
                resources: step.resources().clone(),
            })
            .await?;
        }
    }
    experiment.save().await?;
    Ok(0)
}
