use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gaas_lite::api::client::DispatcherHttpClient;
use gaas_lite::config::{DispatcherConfig, SandboxConfig, WorkerConfig};
use gaas_lite::scheduler::{Dispatcher, Job, SubmissionForm};
use gaas_lite::shutdown::install_shutdown_handler;
use gaas_lite::worker::executor::JobExecutor;
use gaas_lite::worker::local_api::{run_local_api, LocalApiState};
use gaas_lite::worker::WorkerAgent;

#[derive(Parser, Debug)]
#[command(name = "gaas-lite")]
#[command(version)]
#[command(about = "A GPU-as-a-service job dispatcher with sandboxed workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher
    Server(ServerArgs),

    /// Start a worker that claims and executes jobs
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Maximum submission size in MiB
    #[arg(long, default_value = "512")]
    max_upload_mb: usize,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Dispatcher base URL
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    dispatcher: String,

    /// Worker identity; a random one is generated when omitted
    #[arg(long)]
    worker_id: Option<String>,

    /// Port for the local status API (optional)
    #[arg(long)]
    status_port: Option<u16>,

    /// Directory under which job workspaces are created
    #[arg(long, default_value = "jobs")]
    workspace_root: PathBuf,

    /// Base image used when GPU access is available
    #[arg(long)]
    gpu_image: Option<String>,

    /// Base image used otherwise
    #[arg(long)]
    cpu_image: Option<String>,

    /// Hard limit on a single job's run, in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Host binary queried for the GPU inventory on the status API
    #[arg(long, default_value = "nvidia-smi")]
    host_gpu_tool: String,

    /// Start offline; the loop is started through POST /start
    #[arg(long, requires = "status_port")]
    paused: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dispatcher address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Compute tier, e.g. "small"
        #[arg(long)]
        gpu_size: String,

        /// Whitespace-separated dependency specifiers
        #[arg(long)]
        requirements: Option<String>,

        /// CSV dataset uploaded as dataset.csv
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Python source uploaded as model.py
        #[arg(long)]
        code_file: Option<PathBuf>,

        /// Inline Python source; overrides --code-file
        #[arg(long)]
        code: Option<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List all jobs
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    status: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    status: String,
    gpu_size: String,
    assigned_worker: Option<String>,
    result: Option<String>,
    error: Option<String>,
    has_model_file: bool,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl From<&Job> for JobStatusOutput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            status: job.status.to_string(),
            gpu_size: job.gpu_size.clone(),
            assigned_worker: job.assigned_worker.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            has_model_file: job.model_artifact.is_some(),
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    status: String,
    gpu_size: String,
    assigned_worker: Option<String>,
    created_at: String,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

// =============================================================================
// Logging
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = DispatcherConfig {
        listen_addr: format!("0.0.0.0:{}", args.port).parse()?,
        max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_upload_bytes = config.max_upload_bytes,
        "Starting gaas-lite dispatcher"
    );

    let shutdown = install_shutdown_handler();
    gaas_lite::api::serve(&config, Dispatcher::new(), shutdown).await?;

    tracing::info!("Dispatcher stopped");
    Ok(())
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let worker_id = match args.worker_id {
        Some(id) => id,
        None => {
            let id = format!("worker-{}", Uuid::new_v4());
            tracing::warn!(
                worker_id = %id,
                "No --worker-id given, using a generated id; it changes on every restart"
            );
            id
        }
    };

    let defaults = SandboxConfig::default();
    let sandbox = SandboxConfig {
        gpu_image: args.gpu_image.unwrap_or(defaults.gpu_image.clone()),
        cpu_image: args.cpu_image.unwrap_or(defaults.cpu_image.clone()),
        run_timeout: Duration::from_secs(args.timeout_secs),
        workspace_root: args.workspace_root,
        ..defaults
    };

    let status_addr: Option<SocketAddr> = match args.status_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = WorkerConfig::new(worker_id, args.dispatcher).with_sandbox(sandbox);
    config.status_addr = status_addr;
    config.host_gpu_tool = args.host_gpu_tool;

    tracing::info!(
        worker_id = %config.worker_id,
        dispatcher = %config.dispatcher_url,
        status_addr = ?config.status_addr,
        run_timeout_secs = config.sandbox.run_timeout.as_secs(),
        "Starting gaas-lite worker"
    );

    let client = Arc::new(DispatcherHttpClient::from_config(&config)?);
    let executor = JobExecutor::new(config.sandbox.clone());
    let agent = Arc::new(WorkerAgent::new(config.clone(), client, executor));

    let shutdown = install_shutdown_handler();

    if let Some(addr) = config.status_addr {
        let state = LocalApiState {
            agent: agent.clone(),
            nvidia_smi: config.host_gpu_tool.clone(),
        };
        tokio::spawn(run_local_api(addr, state));
    }

    let agent_handle = if args.paused {
        tracing::info!("Worker paused; waiting for POST /start");
        None
    } else {
        Some(tokio::spawn(agent.clone().run()))
    };

    shutdown.cancelled().await;
    agent.status().set_online(false);

    if let Some(handle) = agent_handle {
        tracing::info!("Waiting for the current job to finish");
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker loop ended abnormally");
        }
    }

    tracing::info!("Worker stopped");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &DispatcherHttpClient,
    form: SubmissionForm,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = match client.submit(form).await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error: Job submission failed: {}", e);
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: resp.job_id.to_string(),
                status: resp.status.to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", resp.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &DispatcherHttpClient,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = client.get(&job_id).await?;

    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&JobStatusOutput::from(&job))?
            );
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", job.id);
            println!("Status:          {}", job.status);
            println!("GPU Size:        {}", job.gpu_size);
            if let Some(worker) = &job.assigned_worker {
                println!("Assigned Worker: {}", worker);
            }
            if job.model_artifact.is_some() {
                println!("Model File:      available");
            }
            if let Some(result) = &job.result {
                println!("Output:");
                for line in result.lines() {
                    println!("  {}", line);
                }
            }
            if let Some(error) = &job.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &DispatcherHttpClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<JobListItem> = client
        .list()
        .await?
        .into_iter()
        .map(|job| JobListItem {
            job_id: job.id.to_string(),
            status: job.status.to_string(),
            gpu_size: job.gpu_size,
            assigned_worker: job.assigned_worker,
            created_at: job.created_at.to_rfc3339(),
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: jobs.len(),
                jobs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<10} {:<8} {:<20} CREATED",
                    "JOB ID", "STATUS", "GPU", "WORKER"
                );
                println!("{}", "-".repeat(100));

                for job in &jobs {
                    let worker = job.assigned_worker.as_deref().unwrap_or("-");
                    println!(
                        "{:<38} {:<10} {:<8} {:<20} {}",
                        job.job_id, job.status, job.gpu_size, worker, job.created_at
                    );
                }
                println!();
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn read_optional(path: Option<PathBuf>) -> Result<Option<Vec<u8>>, std::io::Error> {
    match path {
        Some(path) => Ok(Some(tokio::fs::read(&path).await?)),
        None => Ok(None),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let http = DispatcherHttpClient::new(client.addr.clone())?;

            match command {
                JobCommands::Submit {
                    gpu_size,
                    requirements,
                    dataset,
                    code_file,
                    code,
                } => {
                    let form = SubmissionForm {
                        gpu_size: Some(gpu_size),
                        requirements,
                        dataset: read_optional(dataset).await?,
                        source_file: read_optional(code_file).await?,
                        inline_source: code,
                    };
                    handle_job_submit(&http, form, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&http, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
