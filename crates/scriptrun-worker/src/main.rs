//! scriptrun worker CLI

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scriptrun_core::{is_trusted, ClaimedTask, StatusCode, TrustDecision};
use scriptrun_worker::shutdown::install_shutdown_handler;
use scriptrun_worker::{
    serve, FileCredentials, JsonOutput, LocalQueue, StaticCredentials, Worker, WorkerConfig,
    WorkerError,
};

#[derive(Parser)]
#[command(name = "scriptrun-worker")]
#[command(about = "Run queue tasks as local commands", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the worker config (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit lifecycle events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task described in a JSON file and exit with its status code
    Run {
        /// Claimed task (JSON)
        #[arg(short, long)]
        task: PathBuf,
    },

    /// Work through a file of claimed tasks until interrupted, re-reading
    /// credentials from a file as they rotate
    Serve {
        /// Claimed tasks (JSON array)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Queue credentials (JSON), re-read every credential_update_interval
        #[arg(long)]
        credentials: PathBuf,
    },

    /// Check a URL against the configured artifact rules
    #[command(name = "validate-url")]
    ValidateUrl {
        /// URL to check
        url: String,
    },

    /// List the status codes a task can end with
    Statuses,

    /// Print the effective configuration with secrets redacted
    #[command(name = "show-config")]
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(config.log_level())?;

    match cli.command {
        Commands::Run { task } => {
            let status = run_task(config, &task, JsonOutput::new(cli.json)).await?;
            std::process::exit(status.code());
        }
        Commands::Serve { tasks, credentials } => {
            let tasks: Vec<ClaimedTask> = serde_json::from_str(&std::fs::read_to_string(tasks)?)?;
            info!(worker_id = %config.worker_id, tasks = tasks.len(), "Starting scriptrun worker");
            serve(
                Arc::new(config),
                Arc::new(LocalQueue::new(tasks)),
                Arc::new(FileCredentials::new(credentials)),
                JsonOutput::new(cli.json),
                install_shutdown_handler(),
            )
            .await?;
        }
        Commands::ValidateUrl { url } => match is_trusted(&url, &config.valid_artifact_rules) {
            TrustDecision::Trusted { task_id, file_path } => {
                println!("trusted task_id={task_id} file_path={file_path}");
            }
            TrustDecision::Untrusted => {
                println!("untrusted");
                std::process::exit(1);
            }
        },
        Commands::Statuses => {
            for status in StatusCode::ALL {
                println!("{:>2}  {}", status.code(), status);
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(WorkerConfig::load(path)?),
        None => {
            let mut config = WorkerConfig::default();
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
    }
}

/// Logs go to stderr so stdout stays free for `--json` events.
fn init_tracing(level: Level) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run_task(
    config: WorkerConfig,
    task_file: &std::path::Path,
    events: JsonOutput,
) -> Result<StatusCode, Box<dyn std::error::Error>> {
    let task: ClaimedTask = serde_json::from_str(&std::fs::read_to_string(task_file)?)?;

    info!(
        worker_id = %config.worker_id,
        task_id = %task.task_id,
        "Starting scriptrun worker"
    );

    let credentials = Arc::new(StaticCredentials::new(config.credentials.clone()));
    let queue = Arc::new(LocalQueue::new([task]));
    let worker = Worker::new(Arc::new(config), queue, credentials)
        .with_events(events)
        .with_shutdown(install_shutdown_handler());

    match worker.run_once().await? {
        Some(status) => Ok(status),
        None => Err(WorkerError::Queue(scriptrun_worker::QueueError::Fatal(
            "task was not claimed".to_string(),
        ))
        .into()),
    }
}
