use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for Docker-based job execution.
///
/// Every job is built into its own image and run in a sandboxed container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI
    pub runtime: String,
    /// Base image used when the GPU capability probe succeeds
    pub gpu_image: String,
    /// Base image used otherwise
    pub cpu_image: String,
    /// Command run inside the GPU image to check accelerator access
    pub gpu_probe_command: Vec<String>,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "4g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4")
    pub cpu_limit: Option<String>,
    /// Drop all capabilities and forbid privilege escalation
    pub drop_capabilities: bool,
    /// Hard wall-clock limit for the run step
    pub run_timeout: Duration,
    /// Directory under which per-job workspaces are created
    pub workspace_root: PathBuf,
    /// Mount point of the workspace inside the container
    pub container_workdir: String,
    /// File that must be present in every job and is run as the startup command
    pub entry_point: String,
    /// Name of the dependency manifest written when a job has requirements
    pub manifest_name: String,
    /// Artifact file names, highest priority first
    pub artifact_names: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            gpu_image: "nvidia/cuda:12.2.0-runtime-ubuntu22.04".to_string(),
            cpu_image: "python:3.10-slim".to_string(),
            gpu_probe_command: vec!["nvidia-smi".to_string()],
            network_disabled: true,
            memory_limit: Some("4g".to_string()),
            cpu_limit: Some("4".to_string()),
            drop_capabilities: true,
            run_timeout: Duration::from_secs(300),
            workspace_root: PathBuf::from("jobs"),
            container_workdir: "/app".to_string(),
            entry_point: ENTRY_POINT.to_string(),
            manifest_name: "requirements.txt".to_string(),
            artifact_names: ["trained_model.pkl", "model.pkl", "model.pt", "model.h5"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Name of the executable entry point every submission must provide.
pub const ENTRY_POINT: &str = "model.py";

/// Name under which an uploaded dataset is materialized.
pub const DATASET_FILE: &str = "dataset.csv";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on a submission request body (dataset + source)
    pub max_upload_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity presented to the dispatcher; supplied by the deployment
    pub worker_id: String,
    /// Base URL of the dispatcher, e.g. "http://localhost:8000"
    pub dispatcher_url: String,
    /// Request timeout for the assign call
    pub poll_timeout: Duration,
    /// Request timeout for the complete call
    pub complete_timeout: Duration,
    /// Sleep after a job was processed
    pub active_backoff: Duration,
    /// Sleep after a poll that returned no job
    pub idle_backoff: Duration,
    /// Sleep after a poll that failed
    pub error_backoff: Duration,
    /// Maximum number of characters retained in the worker log
    pub log_limit: usize,
    /// Address of the local status API, if enabled
    pub status_addr: Option<SocketAddr>,
    /// Host binary queried for the GPU inventory on the status API
    pub host_gpu_tool: String,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            dispatcher_url: "http://localhost:8000".to_string(),
            poll_timeout: Duration::from_secs(5),
            complete_timeout: Duration::from_secs(10),
            active_backoff: Duration::from_secs(3),
            idle_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            log_limit: 50_000,
            status_addr: None,
            host_gpu_tool: "nvidia-smi".to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, dispatcher_url: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            dispatcher_url: dispatcher_url.into(),
            ..Default::default()
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.runtime, "docker");
        assert_eq!(cfg.cpu_image, "python:3.10-slim");
        assert!(cfg.gpu_image.starts_with("nvidia/cuda"));
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("4g"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("4"));
        assert_eq!(cfg.run_timeout, Duration::from_secs(300));
        assert_eq!(cfg.entry_point, "model.py");
        assert_eq!(cfg.container_workdir, "/app");
    }

    #[test]
    fn artifact_names_keep_priority_order() {
        let cfg = SandboxConfig::default();
        assert_eq!(
            cfg.artifact_names,
            vec!["trained_model.pkl", "model.pkl", "model.pt", "model.h5"]
        );
    }

    #[test]
    fn dispatcher_config_default() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8000");
        assert_eq!(cfg.max_upload_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn worker_config_default_intervals() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.active_backoff, Duration::from_secs(3));
        assert_eq!(cfg.idle_backoff, Duration::from_secs(5));
        assert_eq!(cfg.error_backoff, Duration::from_secs(5));
        assert_eq!(cfg.poll_timeout, Duration::from_secs(5));
        assert_eq!(cfg.complete_timeout, Duration::from_secs(10));
        assert_eq!(cfg.log_limit, 50_000);
        assert!(cfg.status_addr.is_none());
        assert_eq!(cfg.host_gpu_tool, "nvidia-smi");
    }

    #[test]
    fn worker_config_new() {
        let cfg = WorkerConfig::new("gpu-box-7", "http://10.0.0.1:8000");
        assert_eq!(cfg.worker_id, "gpu-box-7");
        assert_eq!(cfg.dispatcher_url, "http://10.0.0.1:8000");
        assert_eq!(cfg.log_limit, 50_000);
    }

    #[test]
    fn host_gpu_tool_is_independent_of_sandbox_probe() {
        let sandbox = SandboxConfig {
            gpu_probe_command: vec!["/usr/bin/true".to_string()],
            ..SandboxConfig::default()
        };
        let cfg = WorkerConfig::new("w1", "http://localhost:8000").with_sandbox(sandbox);
        assert_eq!(cfg.host_gpu_tool, "nvidia-smi");
        assert_eq!(cfg.sandbox.gpu_probe_command, vec!["/usr/bin/true"]);
    }

    #[test]
    fn worker_config_with_sandbox() {
        let sandbox = SandboxConfig {
            run_timeout: Duration::from_secs(30),
            ..SandboxConfig::default()
        };
        let cfg = WorkerConfig::default().with_sandbox(sandbox);
        assert_eq!(cfg.sandbox.run_timeout, Duration::from_secs(30));
    }
}
