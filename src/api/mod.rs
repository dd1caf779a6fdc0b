//! HTTP surface of the dispatcher.
//!
//! [`router`] serves submission, assignment, completion and retrieval over
//! JSON (multipart for submission). [`client::DispatcherHttpClient`] is the
//! matching client used by workers and the CLI.

pub mod client;

use std::net::SocketAddr;

use axum::{
    extract::{rejection::QueryRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::GaasError;
use crate::scheduler::dispatcher::{AssignResponse, CompleteResponse, CompletionReport};
use crate::scheduler::{Dispatcher, Job, JobStatus, SubmissionForm, WorkerState};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct AssignParams {
    worker_id: String,
}

impl IntoResponse for GaasError {
    fn into_response(self) -> Response {
        let status = match &self {
            GaasError::Validation(_) => StatusCode::BAD_REQUEST,
            GaasError::JobNotFound(_) => StatusCode::NOT_FOUND,
            GaasError::NotAssignee { .. } => StatusCode::FORBIDDEN,
            GaasError::InvalidState { .. } => StatusCode::CONFLICT,
            GaasError::Transport(_) | GaasError::Rejected { .. } => StatusCode::BAD_GATEWAY,
            GaasError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job/submit", post(submit_handler))
        .route("/job/assign", post(assign_handler))
        .route("/job/complete", post(complete_handler))
        .route("/job/{job_id}", get(get_job_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/workers", get(list_workers_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

/// Serve the dispatcher API until `shutdown` is cancelled.
pub async fn serve(
    config: &DispatcherConfig,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(ApiState { dispatcher }, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    serve_on(listener, app, shutdown).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Starting dispatcher API");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn submit_handler(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<SubmitResponse>, GaasError> {
    let form = read_submission(multipart).await?;
    let job_id = state.dispatcher.submit(form.into_spec()).await?;
    Ok(Json(SubmitResponse {
        job_id,
        status: JobStatus::Queued,
    }))
}

/// Collect the known form fields; unknown fields are ignored.
async fn read_submission(mut multipart: Multipart) -> Result<SubmissionForm, GaasError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        GaasError::Validation(format!("Malformed submission: {}", e))
    };

    let mut form = SubmissionForm::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "gpu_size" => form.gpu_size = Some(field.text().await.map_err(invalid)?),
            "requirements" => form.requirements = Some(field.text().await.map_err(invalid)?),
            "python_code" => form.inline_source = Some(field.text().await.map_err(invalid)?),
            "dataset" => form.dataset = Some(field.bytes().await.map_err(invalid)?.to_vec()),
            "model_file" => form.source_file = Some(field.bytes().await.map_err(invalid)?.to_vec()),
            other => tracing::debug!(field = other, "Ignoring unknown submission field"),
        }
    }
    Ok(form)
}

async fn assign_handler(
    State(state): State<ApiState>,
    params: Result<Query<AssignParams>, QueryRejection>,
) -> Result<Json<AssignResponse>, GaasError> {
    let Query(params) = params.map_err(|e| GaasError::Validation(e.body_text()))?;
    let job = state.dispatcher.assign(&params.worker_id).await?;
    Ok(Json(AssignResponse { job }))
}

async fn complete_handler(
    State(state): State<ApiState>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<CompleteResponse>, GaasError> {
    let job_id = report.job_id;
    let status = state.dispatcher.complete(report).await?;
    Ok(Json(CompleteResponse { job_id, status }))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, GaasError> {
    Ok(Json(state.dispatcher.get(&job_id).await?))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Json<ListResponse> {
    Json(ListResponse {
        jobs: state.dispatcher.list().await,
    })
}

async fn list_workers_handler(State(state): State<ApiState>) -> Json<Vec<WorkerState>> {
    Json(state.dispatcher.workers().await)
}
