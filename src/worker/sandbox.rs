use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::ExecutionError;

/// Captured result of one runtime invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Everything needed to start one job container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub container_name: String,
    /// Absolute host path mounted read/write at `workdir`
    pub workspace: PathBuf,
    pub workdir: String,
    pub gpu: bool,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub network_disabled: bool,
    pub drop_capabilities: bool,
}

/// Container runtime operations used by the execution engine.
///
/// Implementations must not enforce the run timeout themselves; the engine
/// wraps [`SandboxRunner::run`] in its own deadline and drops the future
/// when it expires, so `run` has to be cancel-safe.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Whether the runtime is installed and reachable.
    async fn is_available(&self) -> bool;

    /// Start a throwaway accelerator-enabled container running `command`.
    async fn probe_gpu(
        &self,
        image: &str,
        command: &[String],
    ) -> Result<CommandOutput, ExecutionError>;

    /// Build `context` into an image tagged `tag`.
    async fn build(&self, context: &Path, tag: &str) -> Result<CommandOutput, ExecutionError>;

    async fn run(&self, spec: &RunSpec) -> Result<CommandOutput, ExecutionError>;

    /// Force-remove a container, running or not.
    async fn remove_container(&self, name: &str) -> Result<(), ExecutionError>;

    /// Force-remove an image.
    async fn remove_image(&self, tag: &str) -> Result<(), ExecutionError>;
}

/// [`SandboxRunner`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.runtime.clone())
    }

    async fn invoke(
        &self,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments for `docker run` of a job container.
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.container_name.clone(),
    ];

    if let Some(ref limit) = spec.memory_limit {
        args.push(format!("--memory={}", limit));
    }

    if let Some(ref limit) = spec.cpu_limit {
        args.push(format!("--cpus={}", limit));
    }

    if spec.network_disabled {
        args.push("--network=none".to_string());
    }

    if spec.drop_capabilities {
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
    }

    args.push("-v".to_string());
    args.push(format!("{}:{}", mount_path(&spec.workspace), spec.workdir));

    if spec.gpu {
        args.push("--gpus".to_string());
        args.push("all".to_string());
    }

    args.push(spec.image.clone());
    args
}

/// Host path in the form the runtime accepts for bind mounts.
fn mount_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if cfg!(windows) {
        raw.replace('\\', "/")
    } else {
        raw.into_owned()
    }
}

#[async_trait]
impl SandboxRunner for DockerCli {
    async fn is_available(&self) -> bool {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        match self.invoke(&args, None).await {
            Ok(output) if output.success() => {
                tracing::debug!(version = %output.stdout.trim(), "Container runtime reachable");
                true
            }
            Ok(output) => {
                tracing::warn!(stderr = %output.stderr.trim(), "Container runtime not reachable");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Container runtime not installed");
                false
            }
        }
    }

    async fn probe_gpu(
        &self,
        image: &str,
        command: &[String],
    ) -> Result<CommandOutput, ExecutionError> {
        let mut args = ["run", "--rm", "--gpus", "all"].map(String::from).to_vec();
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.invoke(&args, None).await
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<CommandOutput, ExecutionError> {
        let args = ["build", "-t", tag, "."].map(String::from);
        self.invoke(&args, Some(context)).await
    }

    async fn run(&self, spec: &RunSpec) -> Result<CommandOutput, ExecutionError> {
        self.invoke(&run_args(spec), None).await
    }

    async fn remove_container(&self, name: &str) -> Result<(), ExecutionError> {
        let args = ["rm", "-f", name].map(String::from);
        let output = self.invoke(&args, None).await?;
        if !output.success() {
            tracing::debug!(
                container = name,
                stderr = %output.stderr.trim(),
                "Container removal reported an error"
            );
        }
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutionError> {
        let args = ["rmi", "-f", tag].map(String::from);
        let output = self.invoke(&args, None).await?;
        if !output.success() {
            tracing::debug!(
                image = tag,
                stderr = %output.stderr.trim(),
                "Image removal reported an error"
            );
        }
        Ok(())
    }
}
