use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::scheduler::dispatcher::CompletionReport;
use crate::scheduler::{Dispatcher, Job, JobStatus};
use crate::worker::executor::JobExecutor;
use crate::worker::status::WorkerStatus;

/// The worker's view of the dispatcher.
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Claim the next queued job, if any.
    async fn assign(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Report the outcome of a job this worker holds.
    async fn complete(&self, report: CompletionReport) -> Result<JobStatus>;
}

#[async_trait]
impl DispatcherClient for Dispatcher {
    async fn assign(&self, worker_id: &str) -> Result<Option<Job>> {
        Dispatcher::assign(self, worker_id).await
    }

    async fn complete(&self, report: CompletionReport) -> Result<JobStatus> {
        Dispatcher::complete(self, report).await
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No job was queued.
    Idle,
    /// A job ran and its report was accepted with this status.
    Reported(JobStatus),
    /// A job ran but the dispatcher did not accept the report.
    ReportRejected,
    /// The dispatcher could not be reached.
    PollFailed,
}

/// Long-running loop that claims jobs, executes them one at a time, and
/// reports the results.
pub struct WorkerAgent {
    config: WorkerConfig,
    client: Arc<dyn DispatcherClient>,
    executor: JobExecutor,
    status: Arc<WorkerStatus>,
}

impl WorkerAgent {
    pub fn new(
        config: WorkerConfig,
        client: Arc<dyn DispatcherClient>,
        executor: JobExecutor,
    ) -> Self {
        let status = Arc::new(WorkerStatus::new(config.log_limit));
        Self {
            config,
            client,
            executor,
            status,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    /// Mark the worker online and run until the flag is cleared.
    ///
    /// A job already executing is finished (or times out) before the flag
    /// is observed. Only one loop runs per worker; calling this while a loop is active
    /// just sets the flag and returns.
    pub async fn run(self: Arc<Self>) {
        self.status.set_online(true);
        if !self.status.claim_loop() {
            tracing::debug!(worker_id = %self.config.worker_id, "Worker loop already running");
            return;
        }
        tracing::info!(worker_id = %self.config.worker_id, "Worker loop started");

        loop {
            while self.status.is_online() {
                let outcome = self.run_once().await;
                tokio::time::sleep(self.backoff(&outcome)).await;
            }
            self.status.release_loop();

            // A start request may have arrived while this loop was winding down.
            if !self.status.is_online() || !self.status.claim_loop() {
                break;
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker loop stopped");
    }

    /// Sleep between iterations after `outcome`.
    pub fn backoff(&self, outcome: &PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Idle => self.config.idle_backoff,
            PollOutcome::PollFailed => self.config.error_backoff,
            PollOutcome::Reported(_) | PollOutcome::ReportRejected => self.config.active_backoff,
        }
    }

    /// Poll once and, if a job was handed out, execute and report it.
    pub async fn run_once(&self) -> PollOutcome {
        let worker_id = self.config.worker_id.as_str();

        let job = match self.client.assign(worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(worker_id, "No job available");
                return PollOutcome::Idle;
            }
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Failed to contact dispatcher");
                self.status
                    .log_line(&format!("Failed to contact dispatcher: {}", e))
                    .await;
                return PollOutcome::PollFailed;
            }
        };

        let job_id = job.id;
        self.status.set_current_job(Some(job_id)).await;
        self.status
            .log(&format!("\nStarting job {}...\n", job_id))
            .await;

        let result = self.executor.execute(&job).await;
        self.status.log(&result.output).await;

        let report = CompletionReport {
            job_id,
            worker_id: worker_id.to_string(),
            output: result.output.clone(),
            success: result.success(),
            model_file: result.artifact,
        };

        let outcome = self.report(report).await;
        self.status.set_current_job(None).await;
        outcome
    }

    /// Deliver a completion report.
    ///
    /// Transport failures and dispatcher-side errors are retried every
    /// `error_backoff` while the worker stays online. Refusals (wrong
    /// assignee, unknown job, job no longer running) are final.
    async fn report(&self, report: CompletionReport) -> PollOutcome {
        let job_id = report.job_id;
        let mut attempt = 1u32;
        loop {
            match self.client.complete(report.clone()).await {
                Ok(status) => {
                    tracing::info!(
                        job_id = %job_id,
                        status = %status,
                        attempt,
                        "Job result submitted"
                    );
                    return PollOutcome::Reported(status);
                }
                Err(e) if e.is_retryable() && self.status.is_online() => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt,
                        error = %e,
                        "Failed to submit job result, retrying"
                    );
                    self.status
                        .log_line(&format!("Failed to submit job result, retrying: {}", e))
                        .await;
                    attempt += 1;
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job_id,
                        attempt,
                        error = %e,
                        "Failed to submit job result"
                    );
                    self.status.log_line("Failed to submit job result.").await;
                    return PollOutcome::ReportRejected;
                }
            }
        }
    }
}
