//! GPU capability checks.
//!
//! Two separate questions are answered here:
//!
//! - [`probe_host`]: what accelerators does the host have? Queried through
//!   `nvidia-smi` and reported on the local status API. A host without
//!   drivers yields an "unavailable" [`GpuInfo`], never an error.
//! - [`select_base_image`]: can a container on this host actually use them?
//!   Answered by starting a throwaway GPU container before every job build.
//!   The answer is never cached, since drivers and runtimes can change
//!   between jobs.

use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::worker::sandbox::SandboxRunner;

const QUERY_FIELDS: &str = "--query-gpu=name,memory.total,memory.used,utilization.gpu";
const QUERY_FORMAT: &str = "--format=csv,noheader,nounits";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub available: bool,
    pub gpus: Vec<GpuDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GpuInfo {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            gpus: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }
}

/// Query installed accelerators through the driver's management CLI.
pub async fn probe_host(nvidia_smi: &str) -> GpuInfo {
    let output = Command::new(nvidia_smi)
        .args([QUERY_FIELDS, QUERY_FORMAT])
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let gpus = parse_device_list(&String::from_utf8_lossy(&output.stdout));
            GpuInfo {
                available: !gpus.is_empty(),
                gpus,
                error: None,
            }
        }
        Ok(output) => GpuInfo::unavailable(format!(
            "{} exited with {:?}: {}",
            nvidia_smi,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => GpuInfo::unavailable(format!(
            "{} not found (no NVIDIA GPU or drivers not installed)",
            nvidia_smi
        )),
        Err(e) => GpuInfo::unavailable(e.to_string()),
    }
}

/// Parse `nvidia-smi` CSV output, one device per line.
///
/// Lines that do not parse (e.g. `[N/A]` fields on some boards) are logged
/// and skipped rather than failing the whole probe.
pub fn parse_device_list(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match parse_device(line) {
            Some(device) => Some(device),
            None => {
                tracing::warn!(line, "Skipping GPU -- unparseable nvidia-smi line");
                None
            }
        })
        .collect()
}

fn parse_device(line: &str) -> Option<GpuDevice> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, total, used, utilization] = fields.as_slice() else {
        return None;
    };

    Some(GpuDevice {
        name: name.to_string(),
        memory_total_mb: total.parse().ok()?,
        memory_used_mb: used.parse().ok()?,
        utilization_percent: utilization.parse().ok()?,
    })
}

/// Base image chosen for one job build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub image: String,
    pub gpu: bool,
}

/// Run the sandbox capability probe and pick the base image accordingly.
///
/// Any failure, including the probe container not starting at all, falls
/// back to the CPU image.
pub async fn select_base_image(runner: &dyn SandboxRunner, config: &SandboxConfig) -> BaseImage {
    let gpu = match runner
        .probe_gpu(&config.gpu_image, &config.gpu_probe_command)
        .await
    {
        Ok(output) if output.success() => true,
        Ok(output) => {
            tracing::debug!(
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "GPU capability probe failed"
            );
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "GPU capability probe could not start");
            false
        }
    };

    let image = if gpu {
        config.gpu_image.clone()
    } else {
        config.cpu_image.clone()
    };
    tracing::info!(gpu, image = %image, "Selected base image");

    BaseImage { image, gpu }
}
