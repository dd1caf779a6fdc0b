use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::scheduler::job::{is_plain_file_name, Job};

/// Per-execution directory holding a job's files, build spec and outputs.
///
/// Named `<job id>-<6 hex>` so that a job processed twice never reuses a
/// directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
    suffix: String,
    job_id: Uuid,
}

impl Workspace {
    /// Create a fresh workspace under `root`. The returned path is absolute.
    pub async fn create(root: &Path, job_id: Uuid) -> Result<Self, ExecutionError> {
        let suffix = random_suffix();
        let dir = root.join(format!("{}-{}", job_id, suffix));

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| workspace_error(&dir, source))?;
        let path = tokio::fs::canonicalize(&dir)
            .await
            .map_err(|source| workspace_error(&dir, source))?;

        Ok(Self {
            path,
            suffix,
            job_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tag for the image built from this workspace.
    pub fn image_tag(&self) -> String {
        format!("gaas-job-{}-{}", self.short_id(), self.suffix)
    }

    pub fn container_name(&self) -> String {
        format!("gaas-container-{}-{}", self.short_id(), self.suffix)
    }

    fn short_id(&self) -> String {
        self.job_id.simple().to_string()[..8].to_string()
    }

    /// Write every job file, plus the dependency manifest when the job has
    /// requirements. Returns whether a manifest was written.
    pub async fn materialize(
        &self,
        job: &Job,
        manifest_name: &str,
    ) -> Result<bool, ExecutionError> {
        for (name, content) in &job.files {
            if !is_plain_file_name(name) {
                return Err(ExecutionError::Workspace {
                    path: self.path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("refusing to write file {:?}", name),
                    ),
                });
            }
            self.write(name, content).await?;
        }

        if job.requirements.is_empty() {
            return Ok(false);
        }
        self.write(manifest_name, job.requirements.join("\n").as_bytes())
            .await?;
        Ok(true)
    }

    pub async fn write(&self, name: &str, content: &[u8]) -> Result<(), ExecutionError> {
        let file = self.path.join(name);
        tokio::fs::write(&file, content)
            .await
            .map_err(|source| workspace_error(&file, source))
    }

    /// Return the base64 content of the first candidate present.
    pub async fn find_artifact(
        &self,
        candidates: &[String],
    ) -> Result<Option<String>, ExecutionError> {
        for name in candidates {
            let file = self.path.join(name);
            match tokio::fs::read(&file).await {
                Ok(bytes) => {
                    tracing::info!(
                        job_id = %self.job_id,
                        artifact = %name,
                        bytes = bytes.len(),
                        "Found artifact"
                    );
                    return Ok(Some(STANDARD.encode(bytes)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(ExecutionError::ArtifactScan { path: file, source }),
            }
        }
        Ok(None)
    }
}

fn random_suffix() -> String {
    format!("{:06x}", rand::thread_rng().gen_range(0..0x100_0000u32))
}

fn workspace_error(path: &Path, source: std::io::Error) -> ExecutionError {
    ExecutionError::Workspace {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSpec;
    use tempfile::TempDir;

    #[tokio::test]
    async fn workspaces_for_same_job_are_distinct() {
        let root = TempDir::new().unwrap();
        let job_id = Uuid::new_v4();

        let a = Workspace::create(root.path(), job_id).await.unwrap();
        let b = Workspace::create(root.path(), job_id).await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_absolute());
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&job_id.to_string()));
        assert_eq!(name.len(), job_id.to_string().len() + 7);
    }

    #[tokio::test]
    async fn names_are_lowercase_and_unique_per_workspace() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();

        let tag = ws.image_tag();
        assert!(tag.starts_with("gaas-job-"));
        assert_eq!(tag, tag.to_lowercase());
        assert!(ws.container_name().ends_with(&ws.suffix));
    }

    #[tokio::test]
    async fn materialize_writes_files_and_manifest() {
        let root = TempDir::new().unwrap();
        let job = Job::new(
            JobSpec::new("small", "print('hi')")
                .with_file("dataset.csv", "a,b\n1,2\n")
                .with_requirement("numpy")
                .with_requirement("pandas==2.2.0"),
        );
        let ws = Workspace::create(root.path(), job.id).await.unwrap();

        let has_manifest = ws.materialize(&job, "requirements.txt").await.unwrap();

        assert!(has_manifest);
        assert_eq!(
            std::fs::read_to_string(ws.path().join("model.py")).unwrap(),
            "print('hi')"
        );
        assert_eq!(
            std::fs::read_to_string(ws.path().join("dataset.csv")).unwrap(),
            "a,b\n1,2\n"
        );
        assert_eq!(
            std::fs::read_to_string(ws.path().join("requirements.txt")).unwrap(),
            "numpy\npandas==2.2.0"
        );
    }

    #[tokio::test]
    async fn no_manifest_without_requirements() {
        let root = TempDir::new().unwrap();
        let job = Job::new(JobSpec::new("small", "print('hi')"));
        let ws = Workspace::create(root.path(), job.id).await.unwrap();

        assert!(!ws.materialize(&job, "requirements.txt").await.unwrap());
        assert!(!ws.path().join("requirements.txt").exists());
    }

    #[tokio::test]
    async fn materialize_refuses_escaping_names() {
        let root = TempDir::new().unwrap();
        let mut job = Job::new(JobSpec::new("small", "print('hi')"));
        job.files.insert("../evil.py".to_string(), b"x".to_vec());
        let ws = Workspace::create(root.path(), job.id).await.unwrap();

        let err = ws.materialize(&job, "requirements.txt").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Workspace { .. }));
        assert!(!root.path().join("evil.py").exists());
    }

    #[tokio::test]
    async fn artifact_scan_honours_priority() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        ws.write("model.pt", b"torch").await.unwrap();
        ws.write("model.pkl", b"pickle").await.unwrap();

        let names: Vec<String> = ["trained_model.pkl", "model.pkl", "model.pt", "model.h5"]
            .into_iter()
            .map(String::from)
            .collect();

        let artifact = ws.find_artifact(&names).await.unwrap();
        assert_eq!(artifact, Some(STANDARD.encode(b"pickle")));
    }

    #[tokio::test]
    async fn artifact_scan_without_match_is_none() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();

        let artifact = ws.find_artifact(&["model.h5".to_string()]).await.unwrap();
        assert!(artifact.is_none());
    }
}
