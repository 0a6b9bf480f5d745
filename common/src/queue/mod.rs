pub mod amqp;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Queue declare error: {0}")]
    Declare(String),
    #[error("Publish error: {0}")]
    Publish(String),
    #[error("Consume error: {0}")]
    Consume(String),
    #[error("Ack error: {0}")]
    Ack(String),
}

/// One message handed to a consumer. The tag identifies the delivery for
/// acknowledgment; until acked the broker considers the message in flight and
/// will redeliver it after a consumer crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub tag: u64,
}

/// The broker contract the pipeline consumes: durable named queues,
/// persistent publishes, and per-message acknowledgment. Handed to every
/// stage worker at construction time.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Idempotently declare a durable queue. Called for every queue a stage
    /// reads or writes before consuming or publishing.
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError>;

    /// Durably enqueue a payload. Callers must only publish after the side
    /// effect and job update the message depends on have succeeded.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Register a consumer on a queue with at most one in-flight delivery.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, QueueError>;
}

#[async_trait]
pub trait QueueSubscription: Send {
    /// Wait for the next delivery. Returns `None` when the transport has
    /// shut down and no further deliveries will arrive.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery fully processed. Omission causes redelivery, which is
    /// how retried processing happens after a crash.
    async fn ack(&mut self, tag: u64) -> Result<(), QueueError>;
}
