use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient};

use super::{deserialize_datetime, deserialize_flexible_id, serialize_datetime, StoredObject};

/// Pipeline position of a job. Wire values match the status strings shown to
/// clients, so variants with multi-word names carry explicit renames.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[default]
    Queued,
    Cloning,
    #[serde(rename = "Cloning Complete")]
    CloningComplete,
    #[serde(rename = "Analyzing Security")]
    AnalyzingSecurity,
    #[serde(rename = "Security Scan Complete")]
    SecurityScanComplete,
    #[serde(rename = "Analyzing Complexity")]
    AnalyzingComplexity,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Cloning => "Cloning",
            JobStatus::CloningComplete => "Cloning Complete",
            JobStatus::AnalyzingSecurity => "Analyzing Security",
            JobStatus::SecurityScanComplete => "Security Scan Complete",
            JobStatus::AnalyzingComplexity => "Analyzing Complexity",
            JobStatus::Complete => "Complete",
            JobStatus::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    fn active_states() -> Vec<&'static str> {
        vec![
            JobStatus::Queued.as_str(),
            JobStatus::Cloning.as_str(),
            JobStatus::CloningComplete.as_str(),
            JobStatus::AnalyzingSecurity.as_str(),
            JobStatus::SecurityScanComplete.as_str(),
            JobStatus::AnalyzingComplexity.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    StartClone,
    FinishClone,
    StartSecurity,
    FinishSecurity,
    StartComplexity,
    FinishComplexity,
    Fail,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::StartClone => "start_clone",
            JobTransition::FinishClone => "finish_clone",
            JobTransition::StartSecurity => "start_security",
            JobTransition::FinishSecurity => "finish_security",
            JobTransition::StartComplexity => "start_complexity",
            JobTransition::FinishComplexity => "finish_complexity",
            JobTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    // The start_* events accept re-entry from the stage's own entering and
    // completed states: a redelivered message replays its stage after a crash
    // that happened before the ack.
    state_machine! {
        name: JobLifecycleMachine,
        initial: Queued,
        states: [Queued, Cloning, CloningComplete, AnalyzingSecurity, SecurityScanComplete, AnalyzingComplexity, Complete, Error],
        events {
            start_clone {
                transition: { from: Queued, to: Cloning }
                transition: { from: Cloning, to: Cloning }
                transition: { from: CloningComplete, to: Cloning }
            }
            finish_clone {
                transition: { from: Cloning, to: CloningComplete }
            }
            start_security {
                transition: { from: CloningComplete, to: AnalyzingSecurity }
                transition: { from: AnalyzingSecurity, to: AnalyzingSecurity }
                transition: { from: SecurityScanComplete, to: AnalyzingSecurity }
            }
            finish_security {
                transition: { from: AnalyzingSecurity, to: SecurityScanComplete }
            }
            start_complexity {
                transition: { from: SecurityScanComplete, to: AnalyzingComplexity }
                transition: { from: AnalyzingComplexity, to: AnalyzingComplexity }
            }
            finish_complexity {
                transition: { from: AnalyzingComplexity, to: Complete }
            }
            fail {
                transition: { from: Queued, to: Error }
                transition: { from: Cloning, to: Error }
                transition: { from: CloningComplete, to: Error }
                transition: { from: AnalyzingSecurity, to: Error }
                transition: { from: SecurityScanComplete, to: Error }
                transition: { from: AnalyzingComplexity, to: Error }
            }
        }
    }

    pub(super) fn queued() -> JobLifecycleMachine<(), Queued> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn cloning() -> JobLifecycleMachine<(), Cloning> {
        queued()
            .start_clone()
            .expect("start_clone transition from Queued should exist")
    }

    pub(super) fn cloning_complete() -> JobLifecycleMachine<(), CloningComplete> {
        cloning()
            .finish_clone()
            .expect("finish_clone transition from Cloning should exist")
    }

    pub(super) fn analyzing_security() -> JobLifecycleMachine<(), AnalyzingSecurity> {
        cloning_complete()
            .start_security()
            .expect("start_security transition from CloningComplete should exist")
    }

    pub(super) fn security_scan_complete() -> JobLifecycleMachine<(), SecurityScanComplete> {
        analyzing_security()
            .finish_security()
            .expect("finish_security transition from AnalyzingSecurity should exist")
    }

    pub(super) fn analyzing_complexity() -> JobLifecycleMachine<(), AnalyzingComplexity> {
        security_scan_complete()
            .start_complexity()
            .expect("start_complexity transition from SecurityScanComplete should exist")
    }
}

fn invalid_transition(state: &JobStatus, event: JobTransition) -> AppError {
    AppError::Transition(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (state, event) {
        (JobStatus::Queued, JobTransition::StartClone) => queued()
            .start_clone()
            .map(|_| JobStatus::Cloning)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Cloning, JobTransition::StartClone) => cloning()
            .start_clone()
            .map(|_| JobStatus::Cloning)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::CloningComplete, JobTransition::StartClone) => cloning_complete()
            .start_clone()
            .map(|_| JobStatus::Cloning)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Cloning, JobTransition::FinishClone) => cloning()
            .finish_clone()
            .map(|_| JobStatus::CloningComplete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::CloningComplete, JobTransition::StartSecurity) => cloning_complete()
            .start_security()
            .map(|_| JobStatus::AnalyzingSecurity)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::AnalyzingSecurity, JobTransition::StartSecurity) => analyzing_security()
            .start_security()
            .map(|_| JobStatus::AnalyzingSecurity)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::SecurityScanComplete, JobTransition::StartSecurity) => security_scan_complete()
            .start_security()
            .map(|_| JobStatus::AnalyzingSecurity)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::AnalyzingSecurity, JobTransition::FinishSecurity) => analyzing_security()
            .finish_security()
            .map(|_| JobStatus::SecurityScanComplete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::SecurityScanComplete, JobTransition::StartComplexity) => {
            security_scan_complete()
                .start_complexity()
                .map(|_| JobStatus::AnalyzingComplexity)
                .map_err(|_| invalid_transition(state, event))
        }
        (JobStatus::AnalyzingComplexity, JobTransition::StartComplexity) => analyzing_complexity()
            .start_complexity()
            .map(|_| JobStatus::AnalyzingComplexity)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::AnalyzingComplexity, JobTransition::FinishComplexity) => analyzing_complexity()
            .finish_complexity()
            .map(|_| JobStatus::Complete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Queued, JobTransition::Fail) => queued()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Cloning, JobTransition::Fail) => cloning()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::CloningComplete, JobTransition::Fail) => cloning_complete()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::AnalyzingSecurity, JobTransition::Fail) => analyzing_security()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::SecurityScanComplete, JobTransition::Fail) => security_scan_complete()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::AnalyzingComplexity, JobTransition::Fail) => analyzing_complexity()
            .fail()
            .map(|_| JobStatus::Error)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

fn transition_into(next: JobStatus) -> Option<JobTransition> {
    match next {
        JobStatus::Cloning => Some(JobTransition::StartClone),
        JobStatus::CloningComplete => Some(JobTransition::FinishClone),
        JobStatus::AnalyzingSecurity => Some(JobTransition::StartSecurity),
        JobStatus::SecurityScanComplete => Some(JobTransition::FinishSecurity),
        JobStatus::AnalyzingComplexity => Some(JobTransition::StartComplexity),
        JobStatus::Complete => Some(JobTransition::FinishComplexity),
        JobStatus::Error => Some(JobTransition::Fail),
        JobStatus::Queued => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vulnerability {
    pub id: String,
    pub severity: String,
    pub package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityReport {
    pub vulnerabilities_found: usize,
    pub details: Vec<Vulnerability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplexityReport {
    pub cyclomatic: u32,
    pub maintainability: u32,
}

/// Accumulated findings. Each stage owns exactly one key and writes it via a
/// field-path update, leaving the sibling untouched.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<ComplexityReport>,
}

/// The findings a stage contributes on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportPatch {
    Security(SecurityReport),
    Complexity(ComplexityReport),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisJob {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub user_id: String,
    pub repo_url: String,
    pub status: JobStatus,
    #[serde(default)]
    pub report: JobReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub updated_at: DateTime<Utc>,
}

impl StoredObject for AnalysisJob {
    fn table_name() -> &'static str {
        "analysis_job"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl AnalysisJob {
    pub fn new(user_id: String, repo_url: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            repo_url,
            status: JobStatus::Queued,
            report: JobReport::default(),
            error_details: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates the job record. Called exactly once per request, by the intake
    /// stage, before any downstream stage observes the job.
    pub async fn create(
        db: &SurrealDbClient,
        user_id: String,
        repo_url: String,
    ) -> Result<AnalysisJob, AppError> {
        let job = Self::new(user_id, repo_url);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    pub async fn fetch(db: &SurrealDbClient, id: &str) -> Result<Option<AnalysisJob>, AppError> {
        Ok(db.get_item::<AnalysisJob>(id).await?)
    }

    /// Move the job to `next` along the pipeline path. The update is guarded
    /// on the status this instance was read at; a job that advanced in the
    /// meantime yields a `Transition` error instead of a regression.
    pub async fn advance(
        &self,
        next: JobStatus,
        db: &SurrealDbClient,
    ) -> Result<AnalysisJob, AppError> {
        let event = transition_into(next).ok_or_else(|| {
            AppError::Transition(format!("no transition into {}", next.as_str()))
        })?;
        let computed = compute_next_state(&self.status, event)?;
        debug_assert_eq!(computed, next);

        const ADVANCE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                updated_at = $now
            WHERE status = $expected
            RETURN *;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(ADVANCE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("next", next.as_str()))
            .bind(("expected", self.status.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<AnalysisJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, event))
    }

    /// Write the stage-complete status together with the stage's report key
    /// in one update. The report write is a field-path assignment, so a
    /// redelivered message overwrites its own key with equivalent data and
    /// never clobbers the sibling stage's findings.
    pub async fn complete_stage(
        &self,
        next: JobStatus,
        patch: Option<ReportPatch>,
        db: &SurrealDbClient,
    ) -> Result<AnalysisJob, AppError> {
        let event = transition_into(next).ok_or_else(|| {
            AppError::Transition(format!("no transition into {}", next.as_str()))
        })?;
        let computed = compute_next_state(&self.status, event)?;
        debug_assert_eq!(computed, next);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                updated_at = $now
            WHERE status = $expected
            RETURN *;
        "#;

        const COMPLETE_SECURITY_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                updated_at = $now,
                report.security = $findings
            WHERE status = $expected
            RETURN *;
        "#;

        const COMPLETE_COMPLEXITY_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                updated_at = $now,
                report.complexity = $findings
            WHERE status = $expected
            RETURN *;
        "#;

        let query = match patch {
            None => db.client.query(COMPLETE_QUERY),
            Some(ReportPatch::Security(findings)) => db
                .client
                .query(COMPLETE_SECURITY_QUERY)
                .bind(("findings", findings)),
            Some(ReportPatch::Complexity(findings)) => db
                .client
                .query(COMPLETE_COMPLEXITY_QUERY)
                .bind(("findings", findings)),
        };

        let now = Utc::now();
        let mut result = query
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("next", next.as_str()))
            .bind(("expected", self.status.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<AnalysisJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.status, event))
    }

    /// Record a stage failure. Terminal jobs are left untouched, which makes
    /// the call idempotent under redelivery and keeps `Complete` final.
    pub async fn mark_error(
        db: &SurrealDbClient,
        id: &str,
        details: &str,
    ) -> Result<Option<AnalysisJob>, AppError> {
        const ERROR_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $error,
                error_details = $details,
                updated_at = $now
            WHERE status IN $active_states
            RETURN *;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(ERROR_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("error", JobStatus::Error.as_str()))
            .bind(("details", details.to_string()))
            .bind(("active_states", JobStatus::active_states()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<AnalysisJob> = result.take(0)?;
        Ok(updated)
    }
}
