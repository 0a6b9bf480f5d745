//! Security scan stage. The scan itself is a placeholder with a fixed
//! finding set; the stage still owns the full lifecycle around it, including
//! cleanup of the checkout once the findings are recorded in the report.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{AnalysisJob, JobStatus, ReportPatch, SecurityReport, Vulnerability},
    },
};
use tokio::time::sleep;
use tracing::info;

use crate::messages::{CloneComplete, SecurityScanComplete};
use crate::stage::{StageOutput, StageTask};
use crate::{CLONING_COMPLETE_QUEUE, SECURITY_SCAN_COMPLETE_QUEUE};

pub struct SecurityScanStage {
    scan_duration: Duration,
}

impl SecurityScanStage {
    pub fn new(scan_duration: Duration) -> Self {
        Self { scan_duration }
    }

    fn findings() -> SecurityReport {
        let details = vec![
            Vulnerability {
                id: "CVE-2023-1234".to_string(),
                severity: "High".to_string(),
                package: "left-pad".to_string(),
            },
            Vulnerability {
                id: "CVE-2023-5678".to_string(),
                severity: "Medium".to_string(),
                package: "express".to_string(),
            },
        ];
        SecurityReport {
            vulnerabilities_found: details.len(),
            details,
        }
    }
}

#[async_trait]
impl StageTask for SecurityScanStage {
    type Input = CloneComplete;
    type Output = SecurityScanComplete;

    fn name(&self) -> &'static str {
        "security"
    }

    fn input_queue(&self) -> &'static str {
        CLONING_COMPLETE_QUEUE
    }

    fn output_queue(&self) -> Option<&'static str> {
        Some(SECURITY_SCAN_COMPLETE_QUEUE)
    }

    fn entering_status(&self) -> Option<JobStatus> {
        Some(JobStatus::AnalyzingSecurity)
    }

    fn completed_status(&self) -> Option<JobStatus> {
        Some(JobStatus::SecurityScanComplete)
    }

    fn job_id(&self, input: &CloneComplete) -> Option<String> {
        Some(input.job_id.clone())
    }

    async fn resolve_job(
        &self,
        input: &CloneComplete,
        db: &SurrealDbClient,
    ) -> Result<Option<AnalysisJob>, AppError> {
        AnalysisJob::fetch(db, &input.job_id).await
    }

    async fn perform(
        &self,
        input: &CloneComplete,
        job: &AnalysisJob,
    ) -> Result<StageOutput<SecurityScanComplete>, AppError> {
        info!(job_id = %job.id, clone_dir = %input.clone_dir, "running security scan");
        sleep(self.scan_duration).await;

        let report = Self::findings();

        // The checkout is only needed up to this stage. A redelivered
        // message finds it already gone, which is fine.
        match tokio::fs::remove_dir_all(Path::new(&input.clone_dir)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(StageOutput {
            report: Some(ReportPatch::Security(report)),
            next: Some(SecurityScanComplete {
                job_id: job.id.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{decode_message, encode_message};
    use crate::stage::{FailurePolicy, StageWorker};
    use common::queue::memory::MemoryTransport;
    use common::queue::QueueTransport;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        )
    }

    async fn scanned_job(db: &SurrealDbClient) -> AnalysisJob {
        let job = AnalysisJob::create(db, "u1".to_string(), "url".to_string())
            .await
            .expect("create");
        let job = job.advance(JobStatus::Cloning, db).await.expect("cloning");
        job.advance(JobStatus::CloningComplete, db)
            .await
            .expect("cloning complete")
    }

    async fn run_once(db: Arc<SurrealDbClient>, transport: &MemoryTransport, input: &CloneComplete) {
        let worker = StageWorker::new(
            db,
            Arc::new(transport.clone()),
            SecurityScanStage::new(Duration::from_millis(1)),
            FailurePolicy::AckAndRecord,
            Duration::from_secs(5),
        );
        transport
            .publish(CLONING_COMPLETE_QUEUE, &encode_message(input).expect("encode"))
            .await
            .expect("publish");
        let mut sub = transport
            .subscribe(CLONING_COMPLETE_QUEUE)
            .await
            .expect("subscribe");
        let delivery = sub.next_delivery().await.expect("delivery").expect("message");
        worker
            .handle_delivery(sub.as_mut(), delivery)
            .await
            .expect("handle");
    }

    #[tokio::test]
    async fn records_findings_removes_checkout_and_forwards() {
        let db = memory_db().await;
        let transport = MemoryTransport::new();
        let dir = TempDir::new().expect("tempdir");

        let job = scanned_job(&db).await;
        let clone_dir = dir.path().join(&job.id);
        std::fs::create_dir_all(&clone_dir).expect("mkdir");
        std::fs::write(clone_dir.join("index.js"), b"module.exports = 1;\n").expect("write");

        let input = CloneComplete {
            job_id: job.id.clone(),
            clone_dir: clone_dir.to_string_lossy().into_owned(),
        };
        run_once(db.clone(), &transport, &input).await;

        let stored = AnalysisJob::fetch(&db, &job.id)
            .await
            .expect("fetch")
            .expect("job exists");
        assert_eq!(stored.status, JobStatus::SecurityScanComplete);
        let report = stored.report.security.expect("security report");
        assert_eq!(report.vulnerabilities_found, 2);
        assert_eq!(report.details[0].id, "CVE-2023-1234");
        assert_eq!(report.details[1].package, "express");
        assert!(!clone_dir.exists());

        let mut out = transport
            .subscribe(SECURITY_SCAN_COMPLETE_QUEUE)
            .await
            .expect("subscribe");
        let forwarded = out.next_delivery().await.expect("delivery").expect("message");
        let next: SecurityScanComplete = decode_message(&forwarded.payload).expect("decode");
        assert_eq!(next.job_id, job.id);
    }

    #[tokio::test]
    async fn missing_checkout_is_not_an_error() {
        let db = memory_db().await;
        let transport = MemoryTransport::new();
        let dir = TempDir::new().expect("tempdir");

        let job = scanned_job(&db).await;
        let input = CloneComplete {
            job_id: job.id.clone(),
            clone_dir: dir
                .path()
                .join("already-gone")
                .to_string_lossy()
                .into_owned(),
        };
        run_once(db.clone(), &transport, &input).await;

        let stored = AnalysisJob::fetch(&db, &job.id)
            .await
            .expect("fetch")
            .expect("job exists");
        assert_eq!(stored.status, JobStatus::SecurityScanComplete);
        assert_eq!(transport.queue_depth(SECURITY_SCAN_COMPLETE_QUEUE).await, 1);
    }
}
