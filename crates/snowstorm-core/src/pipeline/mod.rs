//! Event ingestion pipeline
//!
//! Consumes messages from a configured set of named queues, transforms and
//! persists them through the idempotent store, and routes unprocessable
//! messages to the dead-letter queue. Each message reaches exactly one
//! terminal outcome and is acknowledged exactly once, after that outcome.
//!
//! The consumer survives broker connection loss: on transport failure it
//! waits the configured backoff and reconnects all queues, indefinitely,
//! until the shutdown token is cancelled.

pub mod deadletter;
pub mod message;

use std::time::Duration;

use futures::stream::{self, StreamExt};
use lapin::{options::*, types::FieldTable, Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AmqpConfig, PipelineConfig};
use crate::store::EventWriter;
use deadletter::{AmqpDeadLetter, DeadLetterSink};
use message::{transform, Transform};

/// Why a message went to the dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Required fields missing or unparseable; never retried
    Malformed,
    /// Persistence kept failing until the retry bound was exhausted
    RetriesExhausted,
}

/// Terminal outcome of handling one delivery
///
/// Every variant is followed by exactly one acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Record upserted into the store
    Stored,
    /// Raw body published to the dead-letter queue
    DeadLettered(DeadLetterReason),
    /// Dead-letter publish itself failed; body logged and dropped
    Dropped,
}

/// Handle a single raw message body to its terminal outcome.
///
/// Persist failures are treated as transient and re-attempted with the
/// same record up to `retry_bound` total attempts; the upsert is
/// idempotent, so repeats are safe. Malformed bodies skip persistence
/// entirely.
pub async fn handle_message<W, D>(
    writer: &W,
    sink: &D,
    retry_bound: u32,
    raw: &[u8],
) -> HandleOutcome
where
    W: EventWriter,
    D: DeadLetterSink + ?Sized,
{
    let record = match transform(raw) {
        Transform::Event(record) => record,
        Transform::Malformed(reason) => {
            warn!(reason, "Message does not contain the required JSON fields");
            return dead_letter(sink, raw, DeadLetterReason::Malformed).await;
        }
    };

    for attempt in 1..=retry_bound {
        match writer.upsert_event(&record).await {
            Ok(()) => {
                info!(event_id = record.id, event_type = %record.event_type, "Event stored");
                return HandleOutcome::Stored;
            }
            Err(e) => {
                warn!(
                    event_id = record.id,
                    attempt,
                    retry_bound,
                    error = %e,
                    "Event persist attempt failed"
                );
            }
        }
    }

    dead_letter(sink, raw, DeadLetterReason::RetriesExhausted).await
}

async fn dead_letter<D>(sink: &D, raw: &[u8], reason: DeadLetterReason) -> HandleOutcome
where
    D: DeadLetterSink + ?Sized,
{
    match sink.send(raw).await {
        Ok(()) => HandleOutcome::DeadLettered(reason),
        Err(e) => {
            // No deeper fallback exists; the message is lost.
            error!(error = %e, ?reason, "Dead-letter publish failed, dropping message");
            HandleOutcome::Dropped
        }
    }
}

/// Long-running consumer over one or more named queues
pub struct EventConsumer<W> {
    amqp_url: String,
    queues: Vec<String>,
    retry_bound: u32,
    reconnect_backoff: Duration,
    writer: W,
}

impl<W: EventWriter> EventConsumer<W> {
    /// Build a consumer from a comma-delimited queue list
    pub fn new(amqp: &AmqpConfig, pipeline: &PipelineConfig, queues: &str, writer: W) -> Self {
        let queues = queues
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        Self {
            amqp_url: amqp.url.clone(),
            queues,
            retry_bound: pipeline.retry_bound,
            reconnect_backoff: Duration::from_secs(pipeline.reconnect_backoff_secs),
            writer,
        }
    }

    /// Queue names this consumer subscribes to
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// Transport failures never escape this loop; the consumer waits the
    /// reconnect backoff and resumes consumption from all configured
    /// queues. Messages already delivered but not yet acknowledged return
    /// to the broker for redelivery.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.queues.is_empty() {
            error!("No queues configured, consumer not starting");
            return;
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.consume_session(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_secs = self.reconnect_backoff.as_secs(),
                        "Broker connection failed, reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_backoff) => {}
                    }
                }
            }
        }

        info!("Event consumer stopped");
    }

    /// One broker session: connect, subscribe all queues, pump deliveries.
    ///
    /// Returns Ok on observed shutdown, Err on any transport failure.
    async fn consume_session(&self, shutdown: &CancellationToken) -> Result<(), lapin::Error> {
        let connection =
            Connection::connect(&self.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        let sink = AmqpDeadLetter::declare(&channel).await?;

        let mut consumers = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("snowstorm-{queue}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            consumers.push(consumer);
        }

        info!(queues = ?self.queues, "Consuming events");

        // One merged stream; deliveries are handled strictly one at a time.
        let mut deliveries = stream::select_all(consumers);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal observed, stopping consumption");
                    return Ok(());
                }
                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            info!(queue = delivery.routing_key.as_str(), "Processing event");
                            handle_message(&self.writer, &sink, self.retry_bound, &delivery.data)
                                .await;
                            delivery.ack(BasicAckOptions::default()).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(lapin::Error::InvalidChannelState(
                            lapin::ChannelState::Closed,
                        )),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::EventRecord;
    use crate::store::{EventWriter, StoreError};
    use super::deadletter::DeadLetterError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory event store with injectable transient failures
    #[derive(Default)]
    struct MemoryWriter {
        records: Mutex<HashMap<i64, EventRecord>>,
        attempts: AtomicU32,
        failures_before_success: u32,
    }

    impl MemoryWriter {
        fn new() -> Self {
            Self::default()
        }

        fn failing_first(failures: u32) -> Self {
            Self {
                failures_before_success: failures,
                ..Self::default()
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventWriter for MemoryWriter {
        async fn upsert_event(&self, record: &EventRecord) -> Result<(), StoreError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            self.records
                .lock()
                .unwrap()
                .insert(record.id, record.clone());
            Ok(())
        }
    }

    /// Dead-letter sink capturing published bodies
    #[derive(Default)]
    struct MemorySink {
        bodies: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl MemorySink {
        fn new() -> Self {
            Self::default()
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn bodies(&self) -> Vec<Vec<u8>> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for MemorySink {
        async fn send(&self, body: &[u8]) -> Result<(), DeadLetterError> {
            if self.fail {
                return Err(lapin::Error::InvalidChannelState(lapin::ChannelState::Closed).into());
            }
            self.bodies.lock().unwrap().push(body.to_vec());
            Ok(())
        }
    }

    fn well_formed(event_type: &str, marker: u64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_date_time": "2026-01-15 09:30:00.000001",
            "event_type": event_type,
            "marker": marker,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_well_formed_message_is_stored_with_single_attempt() {
        let writer = MemoryWriter::new();
        let sink = MemorySink::new();

        let outcome = handle_message(&writer, &sink, 3, &well_formed("user.created", 1)).await;

        assert_eq!(outcome, HandleOutcome::Stored);
        assert_eq!(writer.attempts(), 1);
        assert!(sink.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let writer = MemoryWriter::failing_first(2);
        let sink = MemorySink::new();

        let outcome = handle_message(&writer, &sink, 3, &well_formed("user.created", 2)).await;

        assert_eq!(outcome, HandleOutcome::Stored);
        assert_eq!(writer.attempts(), 3);
        assert!(sink.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_retry_bound_exhaustion_dead_letters() {
        let writer = MemoryWriter::failing_first(u32::MAX);
        let sink = MemorySink::new();
        let body = well_formed("user.created", 3);

        let outcome = handle_message(&writer, &sink, 3, &body).await;

        assert_eq!(
            outcome,
            HandleOutcome::DeadLettered(DeadLetterReason::RetriesExhausted)
        );
        // Never more than retry_bound persist attempts for one message
        assert_eq!(writer.attempts(), 3);
        assert_eq!(writer.len(), 0);
        assert_eq!(sink.bodies(), vec![body]);
    }

    #[tokio::test]
    async fn test_malformed_message_dead_letters_without_upsert() {
        let writer = MemoryWriter::new();
        let sink = MemorySink::new();
        let body = serde_json::to_vec(&json!({
            "event_date_time": "2026-01-15 09:30:00",
            "origin": "channel",
        }))
        .unwrap();

        let outcome = handle_message(&writer, &sink, 3, &body).await;

        assert_eq!(
            outcome,
            HandleOutcome::DeadLettered(DeadLetterReason::Malformed)
        );
        assert_eq!(writer.attempts(), 0);
        assert_eq!(writer.len(), 0);
        // The dead-letter queue receives the verbatim body
        assert_eq!(sink.bodies(), vec![body]);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_drops_message() {
        let writer = MemoryWriter::new();
        let sink = MemorySink::failing();

        let outcome = handle_message(&writer, &sink, 3, b"not json").await;

        assert_eq!(outcome, HandleOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_batch_of_well_formed_events_all_stored_distinct() {
        let writer = MemoryWriter::new();
        let sink = MemorySink::new();

        for marker in 0..10u64 {
            let outcome =
                handle_message(&writer, &sink, 3, &well_formed("lc.auth.success", marker)).await;
            assert_eq!(outcome, HandleOutcome::Stored);
        }

        assert_eq!(writer.len(), 10);
        assert!(sink.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_of_identical_body_is_idempotent() {
        let writer = MemoryWriter::new();
        let sink = MemorySink::new();
        let body = well_formed("user.session.start", 7);

        assert_eq!(
            handle_message(&writer, &sink, 3, &body).await,
            HandleOutcome::Stored
        );
        assert_eq!(
            handle_message(&writer, &sink, 3, &body).await,
            HandleOutcome::Stored
        );

        // Same body maps to the same key; applying the upsert twice leaves
        // the same stored state as applying it once.
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_consumer_splits_queue_list() {
        let amqp = AmqpConfig {
            url: "amqp://localhost".to_string(),
        };
        let pipeline = PipelineConfig {
            retry_bound: 3,
            reconnect_backoff_secs: 60,
        };

        let consumer = EventConsumer::new(
            &amqp,
            &pipeline,
            "snowstorm_test, snowstorm_other ,,",
            MemoryWriter::new(),
        );

        assert_eq!(consumer.queues(), ["snowstorm_test", "snowstorm_other"]);
    }
}
