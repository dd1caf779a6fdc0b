use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum GaasError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} is not assigned to worker {worker_id}")]
    NotAssignee { job_id: Uuid, worker_id: String },

    #[error("Job {job_id} is not running (status: {status})")]
    InvalidState { job_id: Uuid, status: JobStatus },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Dispatcher rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GaasError>;

impl GaasError {
    /// True when the request may succeed if sent again unchanged: the
    /// dispatcher was unreachable or failed on its side.
    pub fn is_retryable(&self) -> bool {
        match self {
            GaasError::Transport(_) => true,
            GaasError::Rejected { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// Failure of one stage of the sandboxed execution pipeline.
///
/// These never cross the worker/dispatcher boundary as errors; the engine
/// folds them into a failed [`ExecutionResult`](crate::worker::executor::ExecutionResult)
/// whose output is the `Display` text below.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Sandbox runtime not available")]
    RuntimeUnavailable,

    #[error("Workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Build stderr is surfaced verbatim.
    #[error("{stderr}")]
    Build {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Execution timed out")]
    Timeout,

    #[error("Artifact scan failed at {}: {source}", path.display())]
    ArtifactScan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected execution failure: {0}")]
    Unexpected(String),
}

impl ExecutionError {
    /// True for failures caused by the worker host rather than by the job's
    /// own code or dependency list. Such jobs are worth resubmitting as-is.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, ExecutionError::Build { .. } | ExecutionError::Timeout)
    }

    pub fn stage(&self) -> &'static str {
        match self {
            ExecutionError::RuntimeUnavailable => "runtime",
            ExecutionError::Workspace { .. } => "workspace",
            ExecutionError::Spawn { .. } => "spawn",
            ExecutionError::Build { .. } => "build",
            ExecutionError::Timeout => "timeout",
            ExecutionError::ArtifactScan { .. } => "artifact-scan",
            ExecutionError::Unexpected(_) => "unexpected",
        }
    }
}
