//! Dead-letter sink
//!
//! Fallback durable queue for messages the pipeline cannot process or
//! persist. The raw body is published verbatim so operators can inspect
//! and replay it.

use async_trait::async_trait;
use lapin::{options::*, types::FieldTable, BasicProperties, Channel};
use thiserror::Error;

use crate::config::DEADLETTER_QUEUE;

/// Dead-letter publish failure
///
/// There is no deeper fallback: the caller logs the loss and drops the
/// message.
#[derive(Debug, Error)]
#[error("Dead-letter publish failed: {0}")]
pub struct DeadLetterError(String);

impl From<lapin::Error> for DeadLetterError {
    fn from(err: lapin::Error) -> Self {
        DeadLetterError(err.to_string())
    }
}

/// Sink seam for unprocessable messages
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish the raw message body to the dead-letter queue
    async fn send(&self, body: &[u8]) -> Result<(), DeadLetterError>;
}

/// AMQP-backed dead-letter sink publishing to `snowstorm_deadletter`
pub struct AmqpDeadLetter {
    channel: Channel,
}

impl AmqpDeadLetter {
    /// Declare the dead-letter queue and build a sink over `channel`
    pub async fn declare(channel: &Channel) -> Result<Self, lapin::Error> {
        channel
            .queue_declare(
                DEADLETTER_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            channel: channel.clone(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for AmqpDeadLetter {
    async fn send(&self, body: &[u8]) -> Result<(), DeadLetterError> {
        self.channel
            .basic_publish(
                "",
                DEADLETTER_QUEUE,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;

        Ok(())
    }
}
