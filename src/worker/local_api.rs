use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::worker::agent::WorkerAgent;
use crate::worker::gpu::{self, GpuInfo};

#[derive(Clone)]
pub struct LocalApiState {
    pub agent: Arc<WorkerAgent>,
    /// Path or name of the `nvidia-smi` binary
    pub nvidia_smi: String,
}

#[derive(Serialize)]
struct StatusResponse {
    worker_id: String,
    online: bool,
    current_job: Option<Uuid>,
    gpu: GpuInfo,
}

#[derive(Serialize)]
struct ControlResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: String,
}

pub fn router(state: LocalApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/logs", get(logs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_local_api(addr: SocketAddr, state: LocalApiState) {
    tracing::info!(addr = %addr, "Starting worker status API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind worker status API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Worker status API failed");
    }
}

async fn status_handler(State(state): State<LocalApiState>) -> impl IntoResponse {
    let snapshot = state.agent.status().snapshot().await;
    Json(StatusResponse {
        worker_id: state.agent.worker_id().to_string(),
        online: snapshot.online,
        current_job: snapshot.current_job,
        gpu: gpu::probe_host(&state.nvidia_smi).await,
    })
}

async fn start_handler(State(state): State<LocalApiState>) -> impl IntoResponse {
    if !state.agent.status().set_online(true) {
        tracing::info!(worker_id = %state.agent.worker_id(), "Start requested");
    }
    // No-op when a loop is already active.
    tokio::spawn(state.agent.clone().run());
    Json(ControlResponse { status: "started" })
}

async fn stop_handler(State(state): State<LocalApiState>) -> impl IntoResponse {
    if state.agent.status().set_online(false) {
        tracing::info!(worker_id = %state.agent.worker_id(), "Stop requested");
    }
    Json(ControlResponse { status: "stopped" })
}

async fn logs_handler(State(state): State<LocalApiState>) -> impl IntoResponse {
    Json(LogsResponse {
        logs: state.agent.status().logs().await,
    })
}
