//! Final stage. Writes the complexity figures and moves the job to
//! `Complete`; there is no downstream queue.

use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{AnalysisJob, ComplexityReport, JobStatus, ReportPatch},
    },
};
use tokio::time::sleep;
use tracing::info;

use crate::messages::SecurityScanComplete;
use crate::stage::{StageOutput, StageTask};
use crate::SECURITY_SCAN_COMPLETE_QUEUE;

pub struct ComplexityScanStage {
    scan_duration: Duration,
}

impl ComplexityScanStage {
    pub fn new(scan_duration: Duration) -> Self {
        Self { scan_duration }
    }
}

#[async_trait]
impl StageTask for ComplexityScanStage {
    type Input = SecurityScanComplete;
    type Output = ();

    fn name(&self) -> &'static str {
        "complexity"
    }

    fn input_queue(&self) -> &'static str {
        SECURITY_SCAN_COMPLETE_QUEUE
    }

    fn entering_status(&self) -> Option<JobStatus> {
        Some(JobStatus::AnalyzingComplexity)
    }

    fn completed_status(&self) -> Option<JobStatus> {
        Some(JobStatus::Complete)
    }

    fn job_id(&self, input: &SecurityScanComplete) -> Option<String> {
        Some(input.job_id.clone())
    }

    async fn resolve_job(
        &self,
        input: &SecurityScanComplete,
        db: &SurrealDbClient,
    ) -> Result<Option<AnalysisJob>, AppError> {
        AnalysisJob::fetch(db, &input.job_id).await
    }

    async fn perform(
        &self,
        _input: &SecurityScanComplete,
        job: &AnalysisJob,
    ) -> Result<StageOutput<()>, AppError> {
        info!(job_id = %job.id, "running complexity analysis");
        sleep(self.scan_duration).await;

        Ok(StageOutput {
            report: Some(ReportPatch::Complexity(ComplexityReport {
                cyclomatic: 12,
                maintainability: 85,
            })),
            next: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode_message;
    use crate::stage::{FailurePolicy, StageWorker};
    use common::queue::memory::MemoryTransport;
    use common::queue::QueueTransport;
    use common::storage::types::job::{SecurityReport, Vulnerability};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        )
    }

    #[tokio::test]
    async fn completes_the_job_and_keeps_the_security_report() {
        let db = memory_db().await;
        let transport = MemoryTransport::new();

        let job = AnalysisJob::create(&db, "u1".to_string(), "url".to_string())
            .await
            .expect("create");
        let job = job.advance(JobStatus::Cloning, &db).await.expect("cloning");
        let job = job
            .advance(JobStatus::CloningComplete, &db)
            .await
            .expect("cloning complete");
        let job = job
            .advance(JobStatus::AnalyzingSecurity, &db)
            .await
            .expect("analyzing security");
        let job = job
            .complete_stage(
                JobStatus::SecurityScanComplete,
                Some(ReportPatch::Security(SecurityReport {
                    vulnerabilities_found: 1,
                    details: vec![Vulnerability {
                        id: "CVE-2023-1234".to_string(),
                        severity: "High".to_string(),
                        package: "left-pad".to_string(),
                    }],
                })),
                &db,
            )
            .await
            .expect("security complete");

        let worker = StageWorker::new(
            db.clone(),
            Arc::new(transport.clone()),
            ComplexityScanStage::new(Duration::from_millis(1)),
            FailurePolicy::AckAndRecord,
            Duration::from_secs(5),
        );
        let input = SecurityScanComplete {
            job_id: job.id.clone(),
        };
        transport
            .publish(
                SECURITY_SCAN_COMPLETE_QUEUE,
                &encode_message(&input).expect("encode"),
            )
            .await
            .expect("publish");
        let mut sub = transport
            .subscribe(SECURITY_SCAN_COMPLETE_QUEUE)
            .await
            .expect("subscribe");
        let delivery = sub.next_delivery().await.expect("delivery").expect("message");
        worker
            .handle_delivery(sub.as_mut(), delivery)
            .await
            .expect("handle");

        let stored = AnalysisJob::fetch(&db, &job.id)
            .await
            .expect("fetch")
            .expect("job exists");
        assert_eq!(stored.status, JobStatus::Complete);
        let complexity = stored.report.complexity.expect("complexity report");
        assert_eq!(complexity.cyclomatic, 12);
        assert_eq!(complexity.maintainability, 85);
        assert!(stored.report.security.is_some());
        assert_eq!(transport.redeliver_unacked(SECURITY_SCAN_COMPLETE_QUEUE).await, 0);
    }
}
