//! Idempotent persistence layer
//!
//! Keyed upserts and range deletes over the three record kinds. Every
//! operation is a single SQL statement, so a crash mid-call leaves either
//! the prior state or the fully-applied new state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::records::{AccessLogRecord, EventRecord, TicketRecord};

/// Errors from the persistence layer
///
/// Storage failures are transient from the pipeline's point of view: the
/// write is idempotent, so the caller may safely re-attempt.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The record kinds the retention sweeper iterates over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Events,
    Tickets,
    AccessLogs,
}

impl RecordKind {
    /// All kinds, in sweep order
    pub const ALL: [RecordKind; 3] = [RecordKind::AccessLogs, RecordKind::Tickets, RecordKind::Events];

    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Events => "events",
            RecordKind::Tickets => "freshservice",
            RecordKind::AccessLogs => "apistats",
        }
    }

    /// The timestamp column used as the retention cursor
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            RecordKind::Events => "event_date_time",
            RecordKind::Tickets => "updated_at",
            RecordKind::AccessLogs => "date_time",
        }
    }
}

/// Write seam for the ingestion pipeline
///
/// The pipeline only ever upserts events; keeping the seam narrow lets the
/// consumer loop be exercised against an in-memory fake.
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn upsert_event(&self, record: &EventRecord) -> Result<(), StoreError>;
}

/// PostgreSQL-backed idempotent store
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or fully replace a ticket snapshot by primary key
    pub async fn upsert_ticket(&self, record: &TicketRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO freshservice (id, created_at, updated_at, status, channel, service, mi, sla_breached)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                status = EXCLUDED.status,
                channel = EXCLUDED.channel,
                service = EXCLUDED.service,
                mi = EXCLUDED.mi,
                sla_breached = EXCLUDED.sla_breached
            "#,
        )
        .bind(record.id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.status.as_str())
        .bind(&record.channel)
        .bind(&record.service)
        .bind(&record.mi)
        .bind(record.sla_breached)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or fully replace an access-log line by primary key
    pub async fn upsert_access_log(&self, record: &AccessLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO apistats (id, date_time, method, path, status_code, response_time,
                                  user_agent, client_ip, pop, client_country)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                date_time = EXCLUDED.date_time,
                method = EXCLUDED.method,
                path = EXCLUDED.path,
                status_code = EXCLUDED.status_code,
                response_time = EXCLUDED.response_time,
                user_agent = EXCLUDED.user_agent,
                client_ip = EXCLUDED.client_ip,
                pop = EXCLUDED.pop,
                client_country = EXCLUDED.client_country
            "#,
        )
        .bind(&record.id)
        .bind(record.date_time)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.status_code)
        .bind(record.response_time)
        .bind(&record.user_agent)
        .bind(&record.client_ip)
        .bind(&record.pop)
        .bind(&record.client_country)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete all records of `kind` whose retention cursor is at or before
    /// `cutoff`. Returns the number of rows removed.
    pub async fn delete_older_than(
        &self,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        // Table and column names come from the RecordKind enum, never from input.
        let sql = format!(
            "DELETE FROM {} WHERE {} <= $1",
            kind.table(),
            kind.timestamp_column()
        );

        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventWriter for Store {
    /// Insert or fully replace an event by primary key (last-write-wins)
    async fn upsert_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events (id, event_date_time, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                event_date_time = EXCLUDED.event_date_time,
                event_type = EXCLUDED.event_type,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(record.id)
        .bind(record.event_date_time)
        .bind(&record.event_type)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
