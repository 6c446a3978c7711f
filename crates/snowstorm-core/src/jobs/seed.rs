//! Event seeder
//!
//! Publishes synthetic, well-formed events to a named queue for load and
//! pipeline testing. The payload shape mirrors what the production
//! channels emit.

use chrono::{Duration, Utc};
use lapin::{options::*, types::FieldTable, BasicProperties, Connection, ConnectionProperties};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use tracing::info;

use snowstorm_common::SnowstormError;

use crate::config::AmqpConfig;

/// Event types the production channels emit
const EVENT_TYPES: &[&str] = &[
    "user.session.start",
    "lc.auth.failed",
    "lc.addandauth.success",
    "lc.register.request",
    "lc.join.request",
    "user.created",
    "lc.auth.success",
    "lc.register.success",
    "lc.join.failed",
    "user.deleted",
    "lc.auth.request",
    "transaction.exported",
    "lc.join.success",
    "lc.statuschange",
    "lc.addandauth.request",
    "payment.account.status.change",
    "lc.addandauth.failed",
    "payment.account.added",
    "payment.account.removed",
    "lc.register.failed",
    "lc.removed",
];

/// Publishes a batch of synthetic events to one queue
pub struct EventSeeder {
    amqp_url: String,
    queue_name: String,
    message_count: u32,
}

impl EventSeeder {
    pub fn new(amqp: &AmqpConfig, queue_name: &str, message_count: u32) -> Self {
        Self {
            amqp_url: amqp.url.clone(),
            queue_name: queue_name.to_string(),
            message_count,
        }
    }

    /// Publish `message_count` synthetic events
    pub async fn run(&self) -> Result<(), SnowstormError> {
        let connection = Connection::connect(&self.amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| SnowstormError::Queue(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SnowstormError::Queue(e.to_string()))?;

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SnowstormError::Queue(e.to_string()))?;

        for _ in 0..self.message_count {
            let payload = fake_event();
            info!(
                queue = %self.queue_name,
                event_type = payload["event_type"].as_str().unwrap_or_default(),
                "Creating event"
            );

            channel
                .basic_publish(
                    "",
                    &self.queue_name,
                    BasicPublishOptions::default(),
                    &serde_json::to_vec(&payload)?,
                    BasicProperties::default(),
                )
                .await
                .map_err(|e| SnowstormError::Queue(e.to_string()))?
                .await
                .map_err(|e| SnowstormError::Queue(e.to_string()))?;
        }

        info!(
            queue = %self.queue_name,
            message_count = self.message_count,
            "Seeding complete"
        );

        Ok(())
    }
}

/// One synthetic event payload with a random past timestamp
fn fake_event() -> Value {
    let mut rng = rand::thread_rng();

    let event_date_time = Utc::now()
        - Duration::days(rng.gen_range(0..1000))
        - Duration::hours(rng.gen_range(0..24))
        - Duration::minutes(rng.gen_range(0..60))
        - Duration::seconds(rng.gen_range(0..60))
        - Duration::microseconds(rng.gen_range(0..1_000_000));

    json!({
        "event_type": EVENT_TYPES.choose(&mut rng).copied().unwrap_or("user.created"),
        "origin": "channel",
        "channel": "bink",
        "event_date_time": event_date_time.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        "external_user_ref": rng.gen_range(100_000_000i64..=999_999_999).to_string(),
        "internal_user_ref": rng.gen_range(1..1000),
        "email": format!("user{:04}@example.com", rng.gen_range(0..10_000)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::message::{transform, Transform};

    #[test]
    fn test_fake_event_carries_required_fields() {
        let event = fake_event();
        assert!(event["event_date_time"].is_string());
        assert!(event["event_type"].is_string());
        assert!(EVENT_TYPES.contains(&event["event_type"].as_str().unwrap()));
    }

    #[test]
    fn test_fake_event_survives_the_pipeline_transform() {
        for _ in 0..20 {
            let raw = serde_json::to_vec(&fake_event()).unwrap();
            assert!(matches!(transform(&raw), Transform::Event(_)));
        }
    }

    #[test]
    fn test_fake_event_timestamp_is_in_the_past() {
        let event = fake_event();
        let ts = chrono::NaiveDateTime::parse_from_str(
            event["event_date_time"].as_str().unwrap(),
            "%Y-%m-%d %H:%M:%S%.f",
        )
        .unwrap()
        .and_utc();
        assert!(ts <= Utc::now());
    }
}
