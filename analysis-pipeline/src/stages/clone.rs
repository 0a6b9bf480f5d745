//! Clone stage: fetches the repository into a per-job directory under the
//! configured data dir. The directory path is derived from the job id alone,
//! so a redelivered message clones into the same place after wiping any
//! partial checkout from the earlier attempt.

use std::path::PathBuf;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{AnalysisJob, JobStatus},
    },
};
use tokio::process::Command;
use tracing::info;

use crate::messages::{CloneComplete, CloneRequest};
use crate::stage::{StageOutput, StageTask};
use crate::{CLONE_QUEUE, CLONING_COMPLETE_QUEUE};

pub struct CloneStage {
    repos_dir: PathBuf,
}

impl CloneStage {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    pub fn clone_dir(&self, job_id: &str) -> PathBuf {
        self.repos_dir.join(job_id)
    }
}

#[async_trait]
impl StageTask for CloneStage {
    type Input = CloneRequest;
    type Output = CloneComplete;

    fn name(&self) -> &'static str {
        "clone"
    }

    fn input_queue(&self) -> &'static str {
        CLONE_QUEUE
    }

    fn output_queue(&self) -> Option<&'static str> {
        Some(CLONING_COMPLETE_QUEUE)
    }

    fn entering_status(&self) -> Option<JobStatus> {
        Some(JobStatus::Cloning)
    }

    fn completed_status(&self) -> Option<JobStatus> {
        Some(JobStatus::CloningComplete)
    }

    fn job_id(&self, input: &CloneRequest) -> Option<String> {
        Some(input.job_id.clone())
    }

    async fn resolve_job(
        &self,
        input: &CloneRequest,
        db: &SurrealDbClient,
    ) -> Result<Option<AnalysisJob>, AppError> {
        AnalysisJob::fetch(db, &input.job_id).await
    }

    async fn perform(
        &self,
        input: &CloneRequest,
        job: &AnalysisJob,
    ) -> Result<StageOutput<CloneComplete>, AppError> {
        let clone_dir = self.clone_dir(&job.id);

        // Leftovers from an interrupted earlier attempt.
        match tokio::fs::remove_dir_all(&clone_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&self.repos_dir).await?;

        info!(job_id = %job.id, repo_url = %input.repo_url, "cloning repository");
        let output = Command::new("git")
            .arg("clone")
            .arg(&input.repo_url)
            .arg(&clone_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Processing(format!(
                "git clone of '{}' failed: {}",
                input.repo_url,
                stderr.trim()
            )));
        }

        Ok(StageOutput {
            report: None,
            next: Some(CloneComplete {
                job_id: job.id.clone(),
                clone_dir: clone_dir.to_string_lossy().into_owned(),
            }),
        })
    }
}
