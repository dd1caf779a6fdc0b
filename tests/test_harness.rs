//! Shared helpers for integration tests.
//!
//! Provides a scripted [`SandboxRunner`] so the execution pipeline can be
//! exercised without a container runtime, plus builders for configs and jobs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gaas_lite::config::{SandboxConfig, WorkerConfig};
use gaas_lite::error::ExecutionError;
use gaas_lite::scheduler::{Job, JobSpec};
use gaas_lite::worker::{CommandOutput, RunSpec, SandboxRunner};

/// Everything the fake runner was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    IsAvailable,
    ProbeGpu { image: String },
    Build { tag: String },
    Run { image: String, gpu: bool },
    RemoveContainer { name: String },
    RemoveImage { tag: String },
}

/// Scripted [`SandboxRunner`].
///
/// `run` sleeps for `run_delay`, then writes `artifacts` into the mounted
/// workspace and returns `run_output`. A run cut short by the engine's
/// timeout therefore never produces artifacts.
pub struct FakeRunner {
    pub available: bool,
    pub gpu_ok: bool,
    pub build_output: CommandOutput,
    pub run_output: CommandOutput,
    pub run_delay: Duration,
    pub artifacts: Vec<(String, Vec<u8>)>,
    pub run_panic: Option<String>,
    calls: Mutex<Vec<RunnerCall>>,
    runs: Mutex<Vec<RunSpec>>,
    build_contexts: Mutex<Vec<PathBuf>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            available: true,
            gpu_ok: false,
            build_output: ok_output(""),
            run_output: ok_output(""),
            run_delay: Duration::ZERO,
            artifacts: Vec::new(),
            run_panic: None,
            calls: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            build_contexts: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self) -> Self {
        self.gpu_ok = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_build(mut self, output: CommandOutput) -> Self {
        self.build_output = output;
        self
    }

    pub fn with_run(mut self, output: CommandOutput) -> Self {
        self.run_output = output;
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Make `run` panic with `message` instead of returning.
    pub fn with_run_panic(mut self, message: &str) -> Self {
        self.run_panic = Some(message.to_string());
        self
    }

    pub fn with_artifact(mut self, name: &str, content: &[u8]) -> Self {
        self.artifacts.push((name.to_string(), content.to_vec()));
        self
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.runs.lock().unwrap().clone()
    }

    pub fn build_contexts(&self) -> Vec<PathBuf> {
        self.build_contexts.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&RunnerCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: RunnerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    async fn is_available(&self) -> bool {
        self.record(RunnerCall::IsAvailable);
        self.available
    }

    async fn probe_gpu(
        &self,
        image: &str,
        _command: &[String],
    ) -> Result<CommandOutput, ExecutionError> {
        self.record(RunnerCall::ProbeGpu {
            image: image.to_string(),
        });
        if self.gpu_ok {
            Ok(ok_output("GPU 0: Fake Accelerator\n"))
        } else {
            Ok(CommandOutput {
                exit_code: Some(125),
                stdout: String::new(),
                stderr: "could not select device driver \"\" with capabilities: [[gpu]]"
                    .to_string(),
            })
        }
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<CommandOutput, ExecutionError> {
        self.record(RunnerCall::Build {
            tag: tag.to_string(),
        });
        self.build_contexts
            .lock()
            .unwrap()
            .push(context.to_path_buf());
        Ok(self.build_output.clone())
    }

    async fn run(&self, spec: &RunSpec) -> Result<CommandOutput, ExecutionError> {
        self.record(RunnerCall::Run {
            image: spec.image.clone(),
            gpu: spec.gpu,
        });
        self.runs.lock().unwrap().push(spec.clone());

        if let Some(message) = &self.run_panic {
            panic!("{}", message);
        }
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        for (name, content) in &self.artifacts {
            tokio::fs::write(spec.workspace.join(name), content)
                .await
                .unwrap();
        }
        Ok(self.run_output.clone())
    }

    async fn remove_container(&self, name: &str) -> Result<(), ExecutionError> {
        self.record(RunnerCall::RemoveContainer {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutionError> {
        self.record(RunnerCall::RemoveImage {
            tag: tag.to_string(),
        });
        Ok(())
    }
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed_output(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Sandbox config rooted at `root` with a short run timeout.
pub fn test_sandbox_config(root: &Path) -> SandboxConfig {
    SandboxConfig {
        workspace_root: root.to_path_buf(),
        run_timeout: Duration::from_millis(200),
        ..SandboxConfig::default()
    }
}

/// Worker config with millisecond backoffs for fast loop tests.
pub fn test_worker_config(worker_id: &str, root: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::new(worker_id, "http://127.0.0.1:0")
        .with_sandbox(test_sandbox_config(root));
    config.active_backoff = Duration::from_millis(10);
    config.idle_backoff = Duration::from_millis(10);
    config.error_backoff = Duration::from_millis(10);
    config
}

pub fn test_spec(source: &str) -> JobSpec {
    JobSpec::new("small", source)
}

/// A running job as a worker would receive it.
pub fn assigned_job(spec: JobSpec, worker_id: &str) -> Job {
    let mut job = Job::new(spec);
    job.status = gaas_lite::scheduler::JobStatus::Running;
    job.assigned_worker = Some(worker_id.to_string());
    job
}

pub fn shared(runner: FakeRunner) -> Arc<FakeRunner> {
    Arc::new(runner)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
