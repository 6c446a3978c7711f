//! Snowstorm Core Library
//!
//! Ships operational data from external sources into a central PostgreSQL
//! store for downstream reporting.
//!
//! # Overview
//!
//! - **Event Ingestion Pipeline** ([`pipeline`]): consumes application
//!   events off durable AMQP queues, validates and transforms them, and
//!   persists them idempotently; unprocessable messages go to the
//!   dead-letter queue.
//! - **Idempotent Store** ([`store`]): keyed upserts and range deletes
//!   over the three record kinds.
//! - **Leader Election** ([`lock`]): a renewable, short-lived lock per
//!   job name so only one replica performs a periodic job's side effects.
//! - **Collector Jobs & Retention Sweeper** ([`jobs`]): pull access logs
//!   and tickets from external APIs, and sweep records past the
//!   retention horizon.
//! - **Configuration** ([`config`]): one explicit struct built from the
//!   environment at startup.
//!
//! # Delivery guarantees
//!
//! At-least-once delivery with idempotent writes: each message reaches
//! exactly one terminal outcome (stored, dead-lettered, or logged and
//! dropped when the dead-letter publish itself fails) and is acknowledged
//! exactly once, after that outcome. Redelivered duplicates collapse onto
//! the same primary key.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod pipeline;
pub mod records;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use lock::LeaderElection;
pub use pipeline::EventConsumer;
pub use store::Store;
