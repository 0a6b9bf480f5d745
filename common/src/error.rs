use thiserror::Error;

use crate::queue::QueueError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid status transition: {0}")]
    Transition(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Stage processing error: {0}")]
    Processing(String),
    #[error("Stage timed out after {0}s")]
    Timeout(u64),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}
