//! Storage record types
//!
//! The three record kinds snowstorm persists. Every record carries a
//! non-null primary key and a timestamp column, which is the sole cursor
//! the retention sweeper filters on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An ingested application event (`events` table)
///
/// Created by the ingestion pipeline on message receipt. Redelivery of the
/// same `id` fully replaces the prior row, so persistence stays idempotent
/// under at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_date_time: DateTime<Utc>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Ticket lifecycle status as reported by the ticketing API
///
/// Stored as its display string in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Open,
    Pending,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Map the ticketing API's numeric status codes
    pub fn from_api_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(TicketStatus::Open),
            3 => Some(TicketStatus::Pending),
            4 => Some(TicketStatus::Resolved),
            5 => Some(TicketStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "Open",
            TicketStatus::Pending => "Pending",
            TicketStatus::Resolved => "Resolved",
            TicketStatus::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A support-ticket snapshot (`freshservice` table)
///
/// Refreshed by the ticket collector on each run; `updated_at` drives
/// retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TicketStatus,
    pub channel: Option<String>,
    pub service: Option<String>,
    pub mi: Option<String>,
    /// None when the SLA outcome is not yet known
    pub sla_breached: Option<bool>,
}

/// An API access-log line (`apistats` table)
///
/// Source log ids are stable, so re-collection upserts in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessLogRecord {
    pub id: String,
    pub date_time: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub response_time: f64,
    pub user_agent: String,
    pub client_ip: String,
    pub pop: String,
    pub client_country: String,
}

/// Derive a stable, positive event id from a raw message body.
///
/// Inbound messages carry no primary key, so the id is the first eight
/// bytes of the body's SHA-256, masked positive. Redelivery of an
/// identical body always maps to the same key.
pub fn derive_event_id(body: &[u8]) -> i64 {
    let digest = Sha256::digest(body);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    (i64::from_be_bytes(buf)) & i64::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_status_from_api_code() {
        assert_eq!(TicketStatus::from_api_code(2), Some(TicketStatus::Open));
        assert_eq!(TicketStatus::from_api_code(3), Some(TicketStatus::Pending));
        assert_eq!(TicketStatus::from_api_code(4), Some(TicketStatus::Resolved));
        assert_eq!(TicketStatus::from_api_code(5), Some(TicketStatus::Closed));
        assert_eq!(TicketStatus::from_api_code(1), None);
        assert_eq!(TicketStatus::from_api_code(99), None);
    }

    #[test]
    fn test_derive_event_id_is_stable() {
        let body = br#"{"event_type":"user.created","event_date_time":"2026-01-01 00:00:00"}"#;
        assert_eq!(derive_event_id(body), derive_event_id(body));
    }

    #[test]
    fn test_derive_event_id_is_positive() {
        for body in [&b"a"[..], b"b", b"c", b"{}", b"snowstorm"] {
            assert!(derive_event_id(body) >= 0);
        }
    }

    #[test]
    fn test_derive_event_id_differs_for_different_bodies() {
        assert_ne!(derive_event_id(b"one"), derive_event_id(b"two"));
    }
}
