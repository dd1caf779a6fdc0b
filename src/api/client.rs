use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::api::{ErrorBody, ListResponse, SubmitResponse};
use crate::config::WorkerConfig;
use crate::error::{GaasError, Result};
use crate::scheduler::dispatcher::{AssignResponse, CompleteResponse, CompletionReport};
use crate::scheduler::{Job, JobStatus, SubmissionForm, WorkerState};
use crate::worker::agent::DispatcherClient;

/// HTTP client for the dispatcher API.
#[derive(Debug, Clone)]
pub struct DispatcherHttpClient {
    client: Client,
    base_url: String,
    poll_timeout: Duration,
    complete_timeout: Duration,
}

impl DispatcherHttpClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let defaults = WorkerConfig::default();
        Self::with_timeouts(base_url, defaults.poll_timeout, defaults.complete_timeout)
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Self::with_timeouts(
            config.dispatcher_url.clone(),
            config.poll_timeout,
            config.complete_timeout,
        )
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        poll_timeout: Duration,
        complete_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            poll_timeout,
            complete_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn submit(&self, form: SubmissionForm) -> Result<SubmitResponse> {
        let mut body = Form::new();
        if let Some(gpu_size) = form.gpu_size {
            body = body.text("gpu_size", gpu_size);
        }
        if let Some(requirements) = form.requirements {
            body = body.text("requirements", requirements);
        }
        if let Some(dataset) = form.dataset {
            body = body.part("dataset", Part::bytes(dataset).file_name("dataset.csv"));
        }
        if let Some(source) = form.source_file {
            body = body.part("model_file", Part::bytes(source).file_name("model.py"));
        }
        if let Some(inline) = form.inline_source {
            body = body.text("python_code", inline);
        }

        let request = self.client.post(self.url("/job/submit")).multipart(body);
        send_json(request).await
    }

    pub async fn get(&self, job_id: &Uuid) -> Result<Job> {
        let request = self.client.get(self.url(&format!("/job/{}", job_id)));
        send_json(request).await
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        let response: ListResponse = send_json(self.client.get(self.url("/jobs"))).await?;
        Ok(response.jobs)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerState>> {
        send_json(self.client.get(self.url("/workers"))).await
    }
}

#[async_trait]
impl DispatcherClient for DispatcherHttpClient {
    async fn assign(&self, worker_id: &str) -> Result<Option<Job>> {
        let request = self
            .client
            .post(self.url("/job/assign"))
            .query(&[("worker_id", worker_id)])
            .timeout(self.poll_timeout);
        let response: AssignResponse = send_json(request).await?;
        Ok(response.job)
    }

    async fn complete(&self, report: CompletionReport) -> Result<JobStatus> {
        let request = self
            .client
            .post(self.url("/job/complete"))
            .json(&report)
            .timeout(self.complete_timeout);
        let response: CompleteResponse = send_json(request).await?;
        Ok(response.status)
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = check(request.send().await?).await?;
    Ok(response.json().await?)
}

/// Turn a non-2xx response into [`GaasError::Rejected`], keeping the
/// server's `detail` message when it sent one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.detail)
        .unwrap_or(text);
    Err(GaasError::Rejected {
        status: status.as_u16(),
        message,
    })
}
