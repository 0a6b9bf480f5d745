#![allow(clippy::missing_docs_in_private_items)]

pub mod messages;
pub mod stage;
pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use common::{
    error::AppError,
    queue::QueueTransport,
    storage::db::SurrealDbClient,
    utils::config::AppConfig,
};
use tokio::task::JoinHandle;
use tracing::error;

use stage::{StageTask, StageWorker};
use stages::{CloneStage, ComplexityScanStage, IntakeStage, SecurityScanStage};

/// Client submissions land here.
pub const ANALYSIS_QUEUE: &str = "analysis_jobs";
/// Intake -> clone handoff.
pub const CLONE_QUEUE: &str = "clone_jobs";
/// Clone -> security handoff.
pub const CLONING_COMPLETE_QUEUE: &str = "cloning_complete_jobs";
/// Security -> complexity handoff.
pub const SECURITY_SCAN_COMPLETE_QUEUE: &str = "security_scan_complete_jobs";

fn spawn_worker<T: StageTask>(
    db: Arc<SurrealDbClient>,
    transport: Arc<dyn QueueTransport>,
    task: T,
    config: &AppConfig,
) -> JoinHandle<()> {
    let name = task.name();
    let worker = StageWorker::from_config(db, transport, task, config);
    tokio::spawn(async move {
        if let Err(err) = worker.run().await {
            error!(stage = name, error = %err, "stage worker exited");
        }
    })
}

/// Spawn one worker per stage named in `config.stages`. Unknown stage names
/// are a configuration error; a deployment may run any subset, split across
/// processes.
pub fn spawn_stage_workers(
    db: Arc<SurrealDbClient>,
    transport: Arc<dyn QueueTransport>,
    config: &AppConfig,
) -> Result<Vec<JoinHandle<()>>, AppError> {
    let repos_dir = std::path::Path::new(&config.data_dir).join("repos");

    let mut handles = Vec::with_capacity(config.stages.len());
    for stage in &config.stages {
        let handle = match stage.as_str() {
            "intake" => spawn_worker(db.clone(), transport.clone(), IntakeStage, config),
            "clone" => spawn_worker(
                db.clone(),
                transport.clone(),
                CloneStage::new(&repos_dir),
                config,
            ),
            "security" => spawn_worker(
                db.clone(),
                transport.clone(),
                SecurityScanStage::new(Duration::from_secs(config.security_scan_secs)),
                config,
            ),
            "complexity" => spawn_worker(
                db.clone(),
                transport.clone(),
                ComplexityScanStage::new(Duration::from_secs(config.complexity_scan_secs)),
                config,
            ),
            other => {
                return Err(AppError::Validation(format!(
                    "unknown stage '{other}' in configuration"
                )));
            }
        };
        handles.push(handle);
    }
    Ok(handles)
}
