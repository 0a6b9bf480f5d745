//! The reusable per-stage unit: one input queue, an optional output queue,
//! and a task. The driver enforces the handoff ordering that keeps job state
//! consistent under crashes and redelivery: side effect, then report write,
//! then publish, then ack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{error, info, warn};

use common::{
    error::AppError,
    queue::{Delivery, QueueSubscription, QueueTransport},
    storage::{
        db::SurrealDbClient,
        types::job::{AnalysisJob, JobStatus, ReportPatch},
    },
    utils::config::{AppConfig, FailureMode},
};

use crate::messages::{decode_message, encode_message};

/// What `perform` hands back: the stage's report contribution and the
/// continuation payload for the next queue, if any.
pub struct StageOutput<O> {
    pub report: Option<ReportPatch>,
    pub next: Option<O>,
}

/// One pipeline stage. Implementations supply the queue wiring, the status
/// pair the stage moves a job through, and the side-effecting task itself.
/// `perform` must be safely repeatable for the same input: redelivery after a
/// crash re-runs the whole stage.
#[async_trait]
pub trait StageTask: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send + Sync;

    fn name(&self) -> &'static str;
    fn input_queue(&self) -> &'static str;
    fn output_queue(&self) -> Option<&'static str> {
        None
    }
    /// Status written before `perform` runs. `None` for intake, which has no
    /// upstream stage and sets the initial status at creation.
    fn entering_status(&self) -> Option<JobStatus> {
        None
    }
    /// Status written after `perform` succeeds.
    fn completed_status(&self) -> Option<JobStatus> {
        None
    }

    /// The job id carried in the payload, if this stage's input names one.
    /// Lets the driver record a failure against the job even when
    /// `resolve_job` itself fails.
    fn job_id(&self, _input: &Self::Input) -> Option<String> {
        None
    }

    /// Resolve the job this message belongs to. Intake creates the record;
    /// every later stage looks it up by the id carried in the payload.
    async fn resolve_job(
        &self,
        input: &Self::Input,
        db: &SurrealDbClient,
    ) -> Result<Option<AnalysisJob>, AppError>;

    async fn perform(
        &self,
        input: &Self::Input,
        job: &AnalysisJob,
    ) -> Result<StageOutput<Self::Output>, AppError>;
}

/// What happens to the input message after a processing failure. Either way
/// the message is acknowledged: a poisoned message must never loop in the
/// queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the error on the job and drop the message.
    AckAndRecord,
    /// Park the raw payload on a dead-letter queue before dropping.
    DeadLetter { queue: String },
}

impl FailurePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        match config.failure_policy {
            FailureMode::Ack => FailurePolicy::AckAndRecord,
            FailureMode::DeadLetter => FailurePolicy::DeadLetter {
                queue: config.dead_letter_queue.clone(),
            },
        }
    }
}

pub struct StageWorker<T: StageTask> {
    db: Arc<SurrealDbClient>,
    transport: Arc<dyn QueueTransport>,
    task: T,
    policy: FailurePolicy,
    task_deadline: Duration,
}

impl<T: StageTask> StageWorker<T> {
    pub fn new(
        db: Arc<SurrealDbClient>,
        transport: Arc<dyn QueueTransport>,
        task: T,
        policy: FailurePolicy,
        task_deadline: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            task,
            policy,
            task_deadline,
        }
    }

    pub fn from_config(
        db: Arc<SurrealDbClient>,
        transport: Arc<dyn QueueTransport>,
        task: T,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            db,
            transport,
            task,
            FailurePolicy::from_config(config),
            Duration::from_secs(config.stage_timeout_secs),
        )
    }

    /// Declare every queue this stage touches, then consume its input queue
    /// until the transport shuts down. Only transport-level errors escape;
    /// per-message failures are absorbed into the job record.
    pub async fn run(self) -> Result<(), AppError> {
        self.transport.declare_queue(self.task.input_queue()).await?;
        if let Some(queue) = self.task.output_queue() {
            self.transport.declare_queue(queue).await?;
        }
        if let FailurePolicy::DeadLetter { queue } = &self.policy {
            self.transport.declare_queue(queue).await?;
        }

        let mut subscription = self.transport.subscribe(self.task.input_queue()).await?;
        info!(
            stage = self.task.name(),
            queue = self.task.input_queue(),
            "stage worker waiting for messages"
        );

        while let Some(delivery) = subscription.next_delivery().await? {
            self.handle_delivery(subscription.as_mut(), delivery).await?;
        }

        info!(stage = self.task.name(), "input queue closed, stage worker stopping");
        Ok(())
    }

    /// Process one delivery end to end. Acknowledgment is the last action on
    /// every path, so a crash at any earlier point redelivers the message
    /// and re-runs the stage.
    pub async fn handle_delivery(
        &self,
        subscription: &mut dyn QueueSubscription,
        delivery: Delivery,
    ) -> Result<(), AppError> {
        let tag = delivery.tag;

        let input: T::Input = match decode_message(&delivery.payload) {
            Ok(input) => input,
            Err(err) => {
                // Permanent: no amount of redelivery fixes a bad payload.
                warn!(stage = self.task.name(), error = %err, "discarding undecodable message");
                subscription.ack(tag).await?;
                return Ok(());
            }
        };

        let job = match self.task.resolve_job(&input, &self.db).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(stage = self.task.name(), "no job record for message, discarding");
                subscription.ack(tag).await?;
                return Ok(());
            }
            Err(err) => {
                // With a job id in hand the failure belongs on the record;
                // without one there is nothing to attach it to.
                if let Some(job_id) = self.task.job_id(&input) {
                    return self
                        .record_failure(subscription, &delivery, &job_id, err)
                        .await;
                }
                warn!(stage = self.task.name(), error = %err, "failed to resolve job, discarding");
                subscription.ack(tag).await?;
                return Ok(());
            }
        };

        if job.status.is_terminal() {
            info!(
                stage = self.task.name(),
                job_id = %job.id,
                status = job.status.as_str(),
                "job already terminal, skipping"
            );
            subscription.ack(tag).await?;
            return Ok(());
        }

        let job = if let Some(status) = self.task.entering_status() {
            match job.advance(status, &self.db).await {
                Ok(updated) => updated,
                Err(AppError::Transition(reason)) => {
                    // The job advanced past this stage already; this is a
                    // stale redelivery, not a failure.
                    info!(
                        stage = self.task.name(),
                        job_id = %job.id,
                        %reason,
                        "stale delivery, skipping"
                    );
                    subscription.ack(tag).await?;
                    return Ok(());
                }
                Err(err) => {
                    return self
                        .record_failure(subscription, &delivery, &job.id, err)
                        .await;
                }
            }
        } else {
            job
        };

        let outcome = match timeout(self.task_deadline, self.task.perform(&input, &job)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                return self
                    .record_failure(subscription, &delivery, &job.id, err)
                    .await;
            }
            Err(_) => {
                let err = AppError::Timeout(self.task_deadline.as_secs());
                return self
                    .record_failure(subscription, &delivery, &job.id, err)
                    .await;
            }
        };

        let StageOutput { report, next } = outcome;

        let job = if let Some(status) = self.task.completed_status() {
            match job.complete_stage(status, report, &self.db).await {
                Ok(updated) => updated,
                Err(AppError::Transition(reason)) => {
                    // A duplicate of this message already recorded the
                    // completion; the winner publishes the continuation.
                    info!(
                        stage = self.task.name(),
                        job_id = %job.id,
                        %reason,
                        "stage completion already recorded, skipping"
                    );
                    subscription.ack(tag).await?;
                    return Ok(());
                }
                Err(err) => {
                    return self
                        .record_failure(subscription, &delivery, &job.id, err)
                        .await;
                }
            }
        } else {
            job
        };

        if let (Some(queue), Some(next)) = (self.task.output_queue(), next) {
            let payload = match encode_message(&next) {
                Ok(payload) => payload,
                Err(err) => {
                    return self
                        .record_failure(subscription, &delivery, &job.id, err)
                        .await;
                }
            };
            if let Err(err) = self.transport.publish(queue, &payload).await {
                return self
                    .record_failure(subscription, &delivery, &job.id, err.into())
                    .await;
            }
        }

        subscription.ack(tag).await?;
        info!(
            stage = self.task.name(),
            job_id = %job.id,
            status = job.status.as_str(),
            "stage complete"
        );
        Ok(())
    }

    /// Terminal failure handling: the job record is the error log. The stage
    /// is the final authority for its own errors; nothing is re-raised past
    /// the stage boundary and no continuation message is published.
    async fn record_failure(
        &self,
        subscription: &mut dyn QueueSubscription,
        delivery: &Delivery,
        job_id: &str,
        err: AppError,
    ) -> Result<(), AppError> {
        error!(stage = self.task.name(), %job_id, error = %err, "stage failed");

        if let Err(update_err) = AnalysisJob::mark_error(&self.db, job_id, &err.to_string()).await {
            error!(
                stage = self.task.name(),
                %job_id,
                error = %update_err,
                "failed to record job error"
            );
        }

        if let FailurePolicy::DeadLetter { queue } = &self.policy {
            if let Err(publish_err) = self.transport.publish(queue, &delivery.payload).await {
                error!(
                    stage = self.task.name(),
                    %job_id,
                    error = %publish_err,
                    "failed to dead-letter message"
                );
            }
        }

        subscription.ack(delivery.tag).await?;
        Ok(())
    }
}
