use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::ExecutionError;
use crate::scheduler::{Job, JobStatus};
use crate::worker::gpu::{self, BaseImage};
use crate::worker::sandbox::{CommandOutput, DockerCli, RunSpec, SandboxRunner};
use crate::worker::workspace::Workspace;

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Text reported to the dispatcher: stdout then stderr for a finished
    /// run, the failure message otherwise.
    pub output: String,
    /// Base64-encoded artifact
    pub artifact: Option<String>,
    pub error: Option<ExecutionError>,
    pub workspace: Option<PathBuf>,
}

impl ExecutionResult {
    fn failed(job_id: Uuid, error: ExecutionError, workspace: Option<PathBuf>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            exit_code: None,
            output: error.to_string(),
            artifact: None,
            error: Some(error),
            workspace,
        }
    }

    fn finished(
        job_id: Uuid,
        run: CommandOutput,
        artifact: Option<String>,
        workspace: PathBuf,
    ) -> Self {
        // Success is the exit code alone; libraries routinely write
        // warnings to stderr on healthy runs.
        let status = if run.success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        Self {
            job_id,
            status,
            exit_code: run.exit_code,
            output: run.stdout + &run.stderr,
            artifact,
            error: None,
            workspace: Some(workspace),
        }
    }

    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Executes jobs in per-job Docker images with security isolation.
///
/// Each execution:
/// - materializes the job into a fresh workspace
/// - probes GPU access and picks a base image
/// - builds an image holding only the toolchain and dependencies
/// - runs it with the workspace mounted, no network, memory/CPU caps and a
///   hard timeout
/// - collects the first artifact found and removes the image
#[derive(Clone)]
pub struct JobExecutor {
    config: SandboxConfig,
    runner: Arc<dyn SandboxRunner>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let runner = Arc::new(DockerCli::from_config(&config));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: SandboxConfig, runner: Arc<dyn SandboxRunner>) -> Self {
        Self { config, runner }
    }

    /// Execute a job. Never fails: every error becomes a failed result.
    pub async fn execute(&self, job: &Job) -> ExecutionResult {
        tracing::info!(job_id = %job.id, gpu_size = %job.gpu_size, "Executing job");

        if !self.runner.is_available().await {
            tracing::error!(job_id = %job.id, "Sandbox runtime not available");
            return ExecutionResult::failed(job.id, ExecutionError::RuntimeUnavailable, None);
        }

        let workspace = match Workspace::create(&self.config.workspace_root, job.id).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to create workspace");
                return ExecutionResult::failed(job.id, e, None);
            }
        };
        tracing::debug!(
            job_id = %job.id,
            workspace = %workspace.path().display(),
            "Workspace ready"
        );

        let pipeline = AssertUnwindSafe(self.execute_in(job, &workspace)).catch_unwind();
        let result = match pipeline.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::failed(job.id, e, Some(workspace.path().to_path_buf())),
            Err(panic) => ExecutionResult::failed(
                job.id,
                ExecutionError::Unexpected(panic_message(panic.as_ref())),
                Some(workspace.path().to_path_buf()),
            ),
        };

        match &result.error {
            Some(e) => tracing::warn!(
                job_id = %job.id,
                stage = e.stage(),
                infrastructure = e.is_infrastructure(),
                error = %e,
                "Job execution failed"
            ),
            None => tracing::info!(
                job_id = %job.id,
                status = %result.status,
                exit_code = ?result.exit_code,
                artifact = result.artifact.is_some(),
                "Job completed"
            ),
        }

        result
    }

    async fn execute_in(
        &self,
        job: &Job,
        workspace: &Workspace,
    ) -> Result<ExecutionResult, ExecutionError> {
        let has_manifest = workspace
            .materialize(job, &self.config.manifest_name)
            .await?;

        let base = gpu::select_base_image(self.runner.as_ref(), &self.config).await;

        workspace
            .write("Dockerfile", self.build_spec(&base, has_manifest).as_bytes())
            .await?;
        workspace
            .write(".dockerignore", self.build_context_filter().as_bytes())
            .await?;

        // Panics are caught here so the image is removed on every path.
        let tag = workspace.image_tag();
        let outcome = AssertUnwindSafe(self.build_and_run(job, workspace, &base, &tag))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ExecutionError::Unexpected(panic_message(panic.as_ref())))
            });

        if let Err(e) = self.runner.remove_image(&tag).await {
            tracing::warn!(job_id = %job.id, image = %tag, error = %e, "Failed to remove image");
        }

        outcome
    }

    async fn build_and_run(
        &self,
        job: &Job,
        workspace: &Workspace,
        base: &BaseImage,
        tag: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        tracing::info!(job_id = %job.id, image = %tag, "Building image");
        let build = self.runner.build(workspace.path(), tag).await?;
        if !build.success() {
            return Err(ExecutionError::Build {
                exit_code: build.exit_code,
                stderr: build.stderr,
            });
        }

        let spec = RunSpec {
            image: tag.to_string(),
            container_name: workspace.container_name(),
            workspace: workspace.path().to_path_buf(),
            workdir: self.config.container_workdir.clone(),
            gpu: base.gpu,
            memory_limit: self.config.memory_limit.clone(),
            cpu_limit: self.config.cpu_limit.clone(),
            network_disabled: self.config.network_disabled,
            drop_capabilities: self.config.drop_capabilities,
        };

        tracing::info!(
            job_id = %job.id,
            container = %spec.container_name,
            gpu = base.gpu,
            "Running container"
        );
        let deadline = self.config.run_timeout;
        let run = match tokio::time::timeout(deadline, self.runner.run(&spec)).await {
            Ok(run) => run?,
            Err(_) => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout_secs = self.config.run_timeout.as_secs(),
                    "Run timed out, removing container"
                );
                if let Err(e) = self.runner.remove_container(&spec.container_name).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to remove container");
                }
                return Err(ExecutionError::Timeout);
            }
        };

        let artifact = workspace.find_artifact(&self.config.artifact_names).await?;
        Ok(ExecutionResult::finished(
            job.id,
            run,
            artifact,
            workspace.path().to_path_buf(),
        ))
    }

    /// Dockerfile for a job image. Job files are not copied in; they are
    /// mounted at run time.
    pub fn build_spec(&self, base: &BaseImage, has_manifest: bool) -> String {
        let workdir = &self.config.container_workdir;
        let mut spec = format!(
            "FROM {image}\n\
             \n\
             WORKDIR {workdir}\n\
             \n\
             RUN apt-get update && apt-get install -y --no-install-recommends python3 python3-pip && \\\n    \
             rm -rf /var/lib/apt/lists/* && \\\n    \
             ln -sf /usr/bin/python3 /usr/bin/python\n",
            image = base.image,
        );

        if has_manifest {
            let manifest = &self.config.manifest_name;
            spec.push_str(&format!(
                "\nCOPY {manifest} /tmp/{manifest}\n\
                 RUN python -m pip install --no-cache-dir -r /tmp/{manifest}\n"
            ));
        }

        spec.push_str(&format!(
            "\nCMD [\"python\", \"{}\"]\n",
            self.config.entry_point
        ));
        spec
    }

    /// `.dockerignore` limiting the build context to the manifest.
    fn build_context_filter(&self) -> String {
        format!("*\n!{}\n", self.config.manifest_name)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in execution pipeline".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> JobExecutor {
        JobExecutor::new(SandboxConfig::default())
    }

    fn cpu() -> BaseImage {
        BaseImage {
            image: "python:3.10-slim".to_string(),
            gpu: false,
        }
    }

    #[test]
    fn build_spec_starts_from_base_and_runs_entry_point() {
        let spec = executor().build_spec(&cpu(), false);

        assert!(spec.starts_with("FROM python:3.10-slim\n"));
        assert!(spec.contains("WORKDIR /app\n"));
        assert!(spec.contains("python3-pip"));
        assert!(spec.trim_end().ends_with("CMD [\"python\", \"model.py\"]"));
        assert!(!spec.contains("requirements.txt"));
    }

    #[test]
    fn build_spec_installs_manifest_when_present() {
        let spec = executor().build_spec(&cpu(), true);

        assert!(spec.contains("COPY requirements.txt /tmp/requirements.txt\n"));
        assert!(spec.contains("pip install --no-cache-dir -r /tmp/requirements.txt"));
    }

    #[test]
    fn build_spec_never_copies_job_sources() {
        let spec = executor().build_spec(&cpu(), true);
        assert!(!spec.contains("COPY model.py"));
        assert!(!spec.contains("COPY . "));
    }

    #[test]
    fn build_context_is_limited_to_manifest() {
        assert_eq!(executor().build_context_filter(), "*\n!requirements.txt\n");
    }

    #[test]
    fn finished_result_uses_exit_code_for_success() {
        let ok = ExecutionResult::finished(
            Uuid::new_v4(),
            CommandOutput {
                exit_code: Some(0),
                stdout: "epoch 1\n".to_string(),
                stderr: "UserWarning: deprecated\n".to_string(),
            },
            None,
            PathBuf::from("/tmp/ws"),
        );
        assert!(ok.success());
        assert_eq!(ok.output, "epoch 1\nUserWarning: deprecated\n");

        let failed = ExecutionResult::finished(
            Uuid::new_v4(),
            CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: String::new(),
            },
            None,
            PathBuf::from("/tmp/ws"),
        );
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[test]
    fn panic_message_extracts_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
