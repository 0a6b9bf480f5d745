//! In-process queue transport used by tests: same delivery and ack contract
//! as the broker-backed transport, plus a hook to replay unacked deliveries
//! the way a broker would after a consumer crash.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use super::{Delivery, QueueError, QueueSubscription, QueueTransport};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for delivery (unacked ones excluded).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |state| state.ready.len())
    }

    /// Push all unacked deliveries back to the front of the queue, as a
    /// broker does when a consumer disconnects without acking. Returns the
    /// number of redelivered messages.
    pub async fn redeliver_unacked(&self, queue: &str) -> usize {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };

        let mut redelivered: Vec<(u64, Vec<u8>)> = state.unacked.drain().collect();
        redelivered.sort_by_key(|(tag, _)| *tag);
        let count = redelivered.len();
        for entry in redelivered.into_iter().rev() {
            state.ready.push_front(entry);
        }
        count
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.next_tag += 1;
        let tag = state.next_tag;
        state.ready.push_back((tag, payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, QueueError> {
        self.declare_queue(queue).await?;
        Ok(Box::new(MemorySubscription {
            transport: self.clone(),
            queue: queue.to_string(),
        }))
    }
}

struct MemorySubscription {
    transport: MemoryTransport,
    queue: String,
}

#[async_trait]
impl QueueSubscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        loop {
            {
                let mut queues = self.transport.queues.lock().await;
                if let Some(state) = queues.get_mut(&self.queue) {
                    if let Some((tag, payload)) = state.ready.pop_front() {
                        state.unacked.insert(tag, payload.clone());
                        return Ok(Some(Delivery { payload, tag }));
                    }
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), QueueError> {
        let mut queues = self.transport.queues.lock().await;
        let state = queues
            .get_mut(&self.queue)
            .ok_or_else(|| QueueError::Ack(format!("unknown queue '{}'", self.queue)))?;
        state
            .unacked
            .remove(&tag)
            .ok_or_else(|| QueueError::Ack(format!("unknown delivery tag {tag}")))?;
        Ok(())
    }
}
