//! Grading by running an external command.
//!
//! The command is run as `command args... <artifact path>`. Artifacts from
//! stores without a local copy are staged into a scratch file first.
//!
//! - exit 0: stdout holds `{"score": <u32>, "detail": "<optional>"}`
//! - exit 2: the submission is rejected, stderr is the reason
//! - anything else, a timeout or unreadable output is a retryable failure

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use grader_config::GradingConfig;
use grader_job_queue::{Job, JobOutcome};
use grader_workers::{grade_fn, GradeFn, GradingError};

use crate::artifacts::ArtifactStore;

/// Exit status a grader uses to reject a submission outright.
pub const REJECT_EXIT_CODE: i32 = 2;

#[derive(Debug, Deserialize)]
struct GradeReport {
    score: u32,
    #[serde(default)]
    detail: String,
}

pub struct CommandGrader {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    artifacts: Arc<dyn ArtifactStore>,
    scratch_dir: PathBuf,
}

/// The file handed to the grader. Staged copies are removed on drop, which
/// also covers a grading future dropped at shutdown.
#[derive(Debug)]
enum ArtifactFile {
    Local(PathBuf),
    Staged(PathBuf),
}

impl ArtifactFile {
    fn path(&self) -> &Path {
        match self {
            Self::Local(path) | Self::Staged(path) => path,
        }
    }
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        if let Self::Staged(path) = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "failed to remove staged artifact");
            }
        }
    }
}

impl std::fmt::Debug for CommandGrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGrader")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl CommandGrader {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            artifacts,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory for staged copies of non-local artifacts.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// `None` when no grading command is configured.
    pub fn from_config(cfg: &GradingConfig, artifacts: Arc<dyn ArtifactStore>) -> Option<Self> {
        let command = cfg.command.as_ref()?;
        Some(Self::new(
            command.clone(),
            cfg.args.clone(),
            cfg.timeout(),
            artifacts,
        ))
    }

    pub fn into_grade_fn(self) -> GradeFn {
        let grader = Arc::new(self);
        grade_fn(move |job| {
            let grader = Arc::clone(&grader);
            async move { grader.grade(&job).await }
        })
    }

    pub async fn grade(&self, job: &Job) -> Result<JobOutcome, GradingError> {
        let artifact = self.artifact_file(job).await?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg(artifact.path())
            .env("GRADER_JOB_ID", job.id.as_str())
            .env("GRADER_SUBMISSION_ID", job.submission_id.to_string())
            .env("GRADER_ASSESSMENT_ID", job.assessment_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(job_id = %job.id, command = %self.command, "running grader");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| GradingError::Timeout(self.timeout))??;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {
                let report: GradeReport = serde_json::from_slice(&output.stdout).map_err(|e| {
                    GradingError::Failed(format!("unreadable grader output: {e}"))
                })?;
                Ok(JobOutcome::graded(report.score, report.detail))
            }
            Some(REJECT_EXIT_CODE) => {
                let reason = if stderr.is_empty() {
                    "rejected by grader".to_string()
                } else {
                    stderr
                };
                Ok(JobOutcome::rejected(reason))
            }
            code => Err(GradingError::Failed(match code {
                Some(code) => format!("grader exited with status {code}: {stderr}"),
                None => format!("grader terminated by signal: {stderr}"),
            })),
        }
    }

    async fn artifact_file(&self, job: &Job) -> Result<ArtifactFile, GradingError> {
        if let Some(path) = self.artifacts.local_path(&job.artifact_ref) {
            if !fs::try_exists(&path).await? {
                return Err(GradingError::Artifact(format!(
                    "{} is missing from the artifact store",
                    job.artifact_ref
                )));
            }
            return Ok(ArtifactFile::Local(path));
        }

        let bytes = self
            .artifacts
            .get(&job.artifact_ref)
            .await
            .map_err(|e| GradingError::Artifact(e.to_string()))?;
        fs::create_dir_all(&self.scratch_dir).await?;
        let staged = ArtifactFile::Staged(
            self.scratch_dir
                .join(format!("grader-{}", uuid::Uuid::new_v4().simple())),
        );
        fs::write(staged.path(), bytes).await?;
        debug!(job_id = %job.id, path = %staged.path().display(), "staged artifact");
        Ok(staged)
    }
}
