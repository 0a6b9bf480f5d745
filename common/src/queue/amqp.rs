use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio_retry::{strategy::FixedInterval, Retry};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Delivery, QueueError, QueueSubscription, QueueTransport};

/// Messages are published with delivery mode 2 so they survive a broker
/// restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    pub async fn connect(addr: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(addr, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        // One in-flight message per consumer; the handler finishes before the
        // broker pushes the next delivery.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        Ok(Self {
            connection,
            channel,
        })
    }

    /// Retry the initial broker connection on a fixed interval until it
    /// succeeds. Broker unavailability at startup blocks the stage, never a
    /// single job.
    pub async fn connect_with_retry(addr: &str, delay: Duration) -> Result<Self, QueueError> {
        let strategy = FixedInterval::new(delay);
        let transport = Retry::spawn(strategy, || async {
            match Self::connect(addr).await {
                Ok(transport) => Ok(transport),
                Err(err) => {
                    warn!(error = %err, retry_in_secs = delay.as_secs(), "broker unavailable, retrying");
                    Err(err)
                }
            }
        })
        .await?;

        info!("connected to message broker");
        Ok(transport)
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))
    }
}

#[async_trait]
impl QueueTransport for AmqpTransport {
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare(e.to_string()))?;

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, QueueError> {
        let consumer_tag = format!("{}-worker-{}", queue, Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        Ok(Box::new(AmqpSubscription {
            channel: self.channel.clone(),
            consumer,
        }))
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl QueueSubscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                payload: delivery.data,
                tag: delivery.delivery_tag,
            })),
            Some(Err(err)) => Err(QueueError::Consume(err.to_string())),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), QueueError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}
