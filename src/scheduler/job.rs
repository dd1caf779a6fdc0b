use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DATASET_FILE, ENTRY_POINT};
use crate::error::{GaasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Job file contents, keyed by file name.
pub type JobFiles = BTreeMap<String, Vec<u8>>;

/// What a client submits. Turned into a [`Job`] by the store.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub gpu_size: String,
    pub requirements: Vec<String>,
    pub files: JobFiles,
}

impl JobSpec {
    pub fn new(gpu_size: impl Into<String>, entry_point_source: impl Into<Vec<u8>>) -> Self {
        let mut files = JobFiles::new();
        files.insert(ENTRY_POINT.to_string(), entry_point_source.into());
        Self {
            gpu_size: gpu_size.into(),
            requirements: Vec::new(),
            files,
        }
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    /// Check the submission before any record is created.
    pub fn validate(&self) -> Result<()> {
        if self.gpu_size.trim().is_empty() {
            return Err(GaasError::Validation("gpu_size is required".to_string()));
        }
        if !self.files.contains_key(ENTRY_POINT) {
            return Err(GaasError::Validation(format!(
                "Model code is required ({} missing)",
                ENTRY_POINT
            )));
        }
        if let Some(name) = self.files.keys().find(|name| !is_plain_file_name(name)) {
            return Err(GaasError::Validation(format!(
                "Invalid file name: {:?}",
                name
            )));
        }
        Ok(())
    }
}

/// A file name that stays inside the directory it is written to.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Raw fields of a submission form, before entry point resolution.
#[derive(Debug, Clone, Default)]
pub struct SubmissionForm {
    pub gpu_size: Option<String>,
    /// Whitespace-separated dependency specifiers
    pub requirements: Option<String>,
    pub dataset: Option<Vec<u8>>,
    /// Uploaded source file
    pub source_file: Option<Vec<u8>>,
    /// Inline source text; overrides `source_file`
    pub inline_source: Option<String>,
}

impl SubmissionForm {
    /// Resolve the form into a spec. Missing entry points are caught by
    /// [`JobSpec::validate`], not here.
    pub fn into_spec(self) -> JobSpec {
        let mut files = JobFiles::new();

        if let Some(dataset) = self.dataset {
            files.insert(DATASET_FILE.to_string(), dataset);
        }
        if let Some(source) = self.source_file {
            files.insert(ENTRY_POINT.to_string(), source);
        }
        if let Some(inline) = self.inline_source.filter(|s| !s.trim().is_empty()) {
            files.insert(ENTRY_POINT.to_string(), inline.into_bytes());
        }

        JobSpec {
            gpu_size: self.gpu_size.unwrap_or_default(),
            requirements: self
                .requirements
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect(),
            files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: Uuid,
    pub status: JobStatus,
    pub assigned_worker: Option<String>,
    pub gpu_size: String,
    pub requirements: Vec<String>,
    #[serde(with = "base64_files")]
    pub files: JobFiles,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Base64-encoded artifact returned by the worker
    #[serde(rename = "model_file")]
    pub model_artifact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec, Utc::now())
    }

    pub fn with_id(id: Uuid, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            assigned_worker: None,
            gpu_size: spec.gpu_size,
            requirements: spec.requirements,
            files: spec.files,
            result: None,
            error: None,
            model_artifact: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn entry_point(&self) -> Option<&[u8]> {
        self.files.get(ENTRY_POINT).map(Vec::as_slice)
    }
}

/// Serializes file contents as base64 strings.
mod base64_files {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::JobFiles;
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(files: &JobFiles, serializer: S) -> Result<S::Ok, S::Error> {
        files
            .iter()
            .map(|(name, content)| (name.as_str(), STANDARD.encode(content)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JobFiles, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, content)| {
                STANDARD
                    .decode(content.as_bytes())
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("file {}: {}", name, e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_source_overrides_uploaded_file() {
        let spec = SubmissionForm {
            gpu_size: Some("small".to_string()),
            source_file: Some(b"print('file')".to_vec()),
            inline_source: Some("print('inline')".to_string()),
            ..Default::default()
        }
        .into_spec();

        assert_eq!(
            spec.files.get(ENTRY_POINT).map(Vec::as_slice),
            Some(&b"print('inline')"[..])
        );
    }

    #[test]
    fn blank_inline_source_is_ignored() {
        let spec = SubmissionForm {
            gpu_size: Some("small".to_string()),
            source_file: Some(b"print('file')".to_vec()),
            inline_source: Some("   ".to_string()),
            ..Default::default()
        }
        .into_spec();

        assert_eq!(
            spec.files.get(ENTRY_POINT).map(Vec::as_slice),
            Some(&b"print('file')"[..])
        );
    }

    #[test]
    fn requirements_split_on_whitespace() {
        let spec = SubmissionForm {
            gpu_size: Some("large".to_string()),
            requirements: Some("numpy  pandas\nscikit-learn==1.4.2".to_string()),
            inline_source: Some("import numpy".to_string()),
            ..Default::default()
        }
        .into_spec();

        assert_eq!(
            spec.requirements,
            vec!["numpy", "pandas", "scikit-learn==1.4.2"]
        );
    }

    #[test]
    fn dataset_is_stored_under_fixed_name() {
        let spec = SubmissionForm {
            gpu_size: Some("small".to_string()),
            dataset: Some(b"a,b\n1,2\n".to_vec()),
            inline_source: Some("pass".to_string()),
            ..Default::default()
        }
        .into_spec();

        assert!(spec.files.contains_key(DATASET_FILE));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_entry_point() {
        let spec = SubmissionForm {
            gpu_size: Some("small".to_string()),
            dataset: Some(b"a,b\n".to_vec()),
            ..Default::default()
        }
        .into_spec();

        assert!(matches!(spec.validate(), Err(GaasError::Validation(_))));
    }

    #[test]
    fn validate_rejects_missing_gpu_size() {
        let spec = JobSpec::new("", "print(1)");
        assert!(matches!(spec.validate(), Err(GaasError::Validation(_))));
    }

    #[test]
    fn validate_rejects_path_like_file_names() {
        for name in ["../escape.py", "nested/file.py", "..", ""] {
            let spec = JobSpec::new("small", "print(1)").with_file(name, "x");
            assert!(
                matches!(spec.validate(), Err(GaasError::Validation(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn job_json_uses_base64_files_and_wire_names() {
        let job = Job::new(JobSpec::new("small", "print('hi')"));
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["job_id"], job.id.to_string());
        assert_eq!(json["status"], "queued");
        assert_eq!(json["files"]["model.py"], "cHJpbnQoJ2hpJyk=");
        assert!(json["model_file"].is_null());

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn job_json_rejects_invalid_base64() {
        let job = Job::new(JobSpec::new("small", "print('hi')"));
        let mut json = serde_json::to_value(&job).unwrap();
        json["files"]["model.py"] = serde_json::Value::String("%%%".to_string());

        assert!(serde_json::from_value::<Job>(json).is_err());
    }

    #[test]
    fn status_display_and_terminal() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
