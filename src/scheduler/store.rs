use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{GaasError, Result};
use crate::scheduler::job::{Job, JobSpec, JobStatus};

/// Outcome reported by the worker that ran a job.
#[derive(Debug, Clone)]
pub struct Completion {
    pub output: String,
    pub success: bool,
    /// Base64-encoded artifact, kept only on success
    pub artifact: Option<String>,
}

/// Authoritative job records and their state transitions.
///
/// The store itself is not synchronized; [`Dispatcher`](crate::scheduler::Dispatcher)
/// owns it behind a single lock so that every method here runs as one
/// atomic step.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    /// Every id in creation order
    order: Vec<Uuid>,
    /// Queued ids in creation order; front is next to be assigned
    queued: VecDeque<Uuid>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and enqueue a new job. Returns its id.
    pub fn submit(&mut self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let job = Job::new(spec);
        let id = job.id;
        self.insert(job);
        Ok(id)
    }

    /// Insert an already-built queued job.
    pub(crate) fn insert(&mut self, job: Job) {
        let id = job.id;
        if job.status == JobStatus::Queued {
            self.queued.push_back(id);
        }
        self.order.push(id);
        self.jobs.insert(id, job);
    }

    /// Claim the oldest queued job for `worker_id`.
    pub fn assign(&mut self, worker_id: &str) -> Result<Option<Job>> {
        if worker_id.trim().is_empty() {
            return Err(GaasError::Validation("worker_id is required".to_string()));
        }

        while let Some(id) = self.queued.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }

            job.status = JobStatus::Running;
            job.assigned_worker = Some(worker_id.to_string());
            job.started_at = Some(Utc::now());
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    /// Finalize a running job on behalf of its assignee.
    pub fn complete(
        &mut self,
        job_id: &Uuid,
        worker_id: &str,
        completion: Completion,
    ) -> Result<&Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(GaasError::JobNotFound(*job_id))?;

        if job.assigned_worker.as_deref() != Some(worker_id) {
            return Err(GaasError::NotAssignee {
                job_id: *job_id,
                worker_id: worker_id.to_string(),
            });
        }

        if job.status != JobStatus::Running {
            return Err(GaasError::InvalidState {
                job_id: *job_id,
                status: job.status,
            });
        }

        job.completed_at = Some(Utc::now());
        if completion.success {
            job.status = JobStatus::Completed;
            job.result = Some(completion.output);
            job.model_artifact = completion.artifact;
        } else {
            job.status = JobStatus::Failed;
            job.error = Some(completion.output);
        }

        Ok(job)
    }

    pub fn get(&self, job_id: &Uuid) -> Result<&Job> {
        self.jobs.get(job_id).ok_or(GaasError::JobNotFound(*job_id))
    }

    /// All jobs in creation order.
    pub fn list(&self) -> Vec<&Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id)).collect()
    }

    /// Jobs a given worker has been assigned, in creation order.
    pub fn jobs_for_worker(&self, worker_id: &str) -> Vec<&Job> {
        self.list()
            .into_iter()
            .filter(|j| j.assigned_worker.as_deref() == Some(worker_id))
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}
