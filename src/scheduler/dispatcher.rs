use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobSpec, JobStatus};
use crate::scheduler::store::{Completion, JobStore};

/// Worker bookkeeping, for operational visibility only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    pub current_job: Option<Uuid>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl WorkerState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            last_seen: Utc::now(),
            current_job: None,
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Body of a completion report, as sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub job_id: Uuid,
    pub worker_id: String,
    pub output: String,
    #[serde(default = "default_success")]
    pub success: bool,
    /// Base64-encoded artifact
    #[serde(default)]
    pub model_file: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Assignment and completion protocol over a shared [`JobStore`].
///
/// All mutations take the store's write lock for their whole duration,
/// so claim-and-transition and the assignee check are atomic with respect
/// to every other caller.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    store: Arc<RwLock<JobStore>>,
    workers: Arc<RwLock<HashMap<String, WorkerState>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        let (job_id, queued) = {
            let mut store = self.store.write().await;
            let job_id = store.submit(spec)?;
            (job_id, store.queued_len())
        };
        tracing::info!(job_id = %job_id, queued, "Job queued");
        Ok(job_id)
    }

    /// Hand the oldest queued job to `worker_id`, if there is one.
    pub async fn assign(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = self.store.write().await.assign(worker_id)?;

        let mut workers = self.workers.write().await;
        let worker = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                tracing::info!(worker_id, "Worker registered");
                WorkerState::new(worker_id)
            });
        worker.touch();

        if let Some(job) = &job {
            worker.current_job = Some(job.id);
            tracing::info!(job_id = %job.id, worker_id, "Job assigned");
        }

        Ok(job)
    }

    /// Apply a worker's completion report.
    pub async fn complete(&self, report: CompletionReport) -> Result<JobStatus> {
        let status = {
            let mut store = self.store.write().await;
            let job = store.complete(
                &report.job_id,
                &report.worker_id,
                Completion {
                    output: report.output,
                    success: report.success,
                    artifact: report.model_file,
                },
            );
            match job {
                Ok(job) => job.status,
                Err(e) => {
                    tracing::warn!(
                        job_id = %report.job_id,
                        worker_id = %report.worker_id,
                        error = %e,
                        "Completion rejected"
                    );
                    return Err(e);
                }
            }
        };

        if let Some(worker) = self.workers.write().await.get_mut(&report.worker_id) {
            worker.touch();
            if worker.current_job == Some(report.job_id) {
                worker.current_job = None;
            }
            match status {
                JobStatus::Completed => worker.jobs_completed += 1,
                _ => worker.jobs_failed += 1,
            }
        }

        tracing::info!(
            job_id = %report.job_id,
            worker_id = %report.worker_id,
            status = %status,
            "Job finished"
        );
        Ok(status)
    }

    pub async fn get(&self, job_id: &Uuid) -> Result<Job> {
        self.store.read().await.get(job_id).cloned()
    }

    pub async fn list(&self) -> Vec<Job> {
        self.store.read().await.list().into_iter().cloned().collect()
    }

    /// Every worker that has polled at least once, ordered by id.
    pub async fn workers(&self) -> Vec<WorkerState> {
        let mut workers: Vec<WorkerState> =
            self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }
}
