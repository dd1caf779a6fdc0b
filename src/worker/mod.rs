//! Worker side of the system: claims jobs and runs them in sandboxes.
//!
//! # Components
//!
//! - [`WorkerAgent`]: poll/execute/report loop, one job at a time
//! - [`JobExecutor`]: per-job workspace, image build, container run,
//!   artifact collection and image cleanup
//! - [`SandboxRunner`]: container runtime seam; [`DockerCli`] shells out to
//!   `docker`
//! - [`gpu`]: host accelerator inventory and the per-job capability probe
//! - [`local_api`]: status/start/stop/logs endpoints for the host
//!
//! # Execution Flow
//!
//! 1. Agent calls `assign` on the dispatcher
//! 2. [`JobExecutor::execute`] builds and runs the job's container
//! 3. Output, success flag and artifact go back through `complete`
//! 4. Agent sleeps a configured backoff and polls again
//!
//! Failures inside execution never escape the executor; they arrive at the
//! dispatcher as a failed completion.

pub mod agent;
pub mod executor;
pub mod gpu;
pub mod local_api;
pub mod sandbox;
pub mod status;
pub mod workspace;

pub use agent::{DispatcherClient, PollOutcome, WorkerAgent};
pub use executor::{ExecutionResult, JobExecutor};
pub use sandbox::{CommandOutput, DockerCli, RunSpec, SandboxRunner};
pub use status::{LogBuffer, WorkerStatus};
