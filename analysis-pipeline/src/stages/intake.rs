//! First stage: turns a client submission into a persistent job record and
//! hands the job to the clone queue. Intake has no status pair of its own,
//! the record is born `Queued`.

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::job::AnalysisJob},
};
use tracing::info;

use crate::messages::{AnalysisRequest, CloneRequest};
use crate::stage::{StageOutput, StageTask};
use crate::{ANALYSIS_QUEUE, CLONE_QUEUE};

pub struct IntakeStage;

#[async_trait]
impl StageTask for IntakeStage {
    type Input = AnalysisRequest;
    type Output = CloneRequest;

    fn name(&self) -> &'static str {
        "intake"
    }

    fn input_queue(&self) -> &'static str {
        ANALYSIS_QUEUE
    }

    fn output_queue(&self) -> Option<&'static str> {
        Some(CLONE_QUEUE)
    }

    async fn resolve_job(
        &self,
        input: &AnalysisRequest,
        db: &SurrealDbClient,
    ) -> Result<Option<AnalysisJob>, AppError> {
        if input.repo_url.trim().is_empty() {
            return Err(AppError::Validation("repoUrl must not be empty".to_string()));
        }
        if input.user_id.trim().is_empty() {
            return Err(AppError::Validation("userId must not be empty".to_string()));
        }

        let job = AnalysisJob::create(db, input.user_id.clone(), input.repo_url.clone()).await?;
        info!(job_id = %job.id, repo_url = %job.repo_url, "accepted analysis request");
        Ok(Some(job))
    }

    async fn perform(
        &self,
        _input: &AnalysisRequest,
        job: &AnalysisJob,
    ) -> Result<StageOutput<CloneRequest>, AppError> {
        Ok(StageOutput {
            report: None,
            next: Some(CloneRequest {
                job_id: job.id.clone(),
                repo_url: job.repo_url.clone(),
            }),
        })
    }
}
