//! Message transform step
//!
//! Raw queue bodies become [`EventRecord`]s here. Classification is an
//! explicit result type: a message either maps to a record or is
//! malformed, a permanent failure that is never retried.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::records::{derive_event_id, EventRecord};

/// Outcome of transforming one raw message body
#[derive(Debug)]
pub enum Transform {
    /// Body mapped to a persistable record
    Event(EventRecord),
    /// Body is permanently unprocessable; goes straight to the dead letter
    Malformed(&'static str),
}

/// Transform a raw message body into an event record.
///
/// The body must be a JSON object carrying `event_date_time` and
/// `event_type`; both are lifted out and the remaining fields become the
/// record's payload. An integer `id` field keys the record when present,
/// otherwise a stable id is derived from the body bytes.
pub fn transform(raw: &[u8]) -> Transform {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return Transform::Malformed("body is not valid JSON"),
    };

    let Value::Object(mut fields) = value else {
        return Transform::Malformed("body is not a JSON object");
    };

    let Some(raw_date_time) = fields.remove("event_date_time") else {
        return Transform::Malformed("missing event_date_time");
    };

    let Some(event_date_time) = raw_date_time.as_str().and_then(parse_event_timestamp) else {
        return Transform::Malformed("event_date_time is not a timestamp");
    };

    let event_type = match fields.remove("event_type") {
        Some(Value::String(s)) => s,
        Some(_) => return Transform::Malformed("event_type is not a string"),
        None => return Transform::Malformed("missing event_type"),
    };

    let id = fields
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| derive_event_id(raw));

    Transform::Event(EventRecord {
        id,
        event_date_time,
        event_type,
        payload: Value::Object(fields),
    })
}

/// Parse the timestamp formats producers emit.
///
/// RFC 3339 and the bare `YYYY-MM-DD HH:MM:SS[.ffffff]` form (taken as
/// UTC) are accepted.
fn parse_event_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_transform_well_formed_message() {
        let raw = body(&json!({
            "event_date_time": "2026-01-15 09:30:00.123456",
            "event_type": "user.created",
            "origin": "channel",
            "external_user_ref": "123456789",
        }));

        let Transform::Event(record) = transform(&raw) else {
            panic!("expected an event");
        };

        assert_eq!(record.event_type, "user.created");
        assert_eq!(record.payload["origin"], "channel");
        assert_eq!(record.payload["external_user_ref"], "123456789");
        // Lifted fields do not remain in the payload
        assert!(record.payload.get("event_type").is_none());
        assert!(record.payload.get("event_date_time").is_none());
    }

    #[test]
    fn test_transform_missing_event_type_is_malformed() {
        let raw = body(&json!({
            "event_date_time": "2026-01-15 09:30:00",
            "origin": "channel",
        }));

        assert!(matches!(transform(&raw), Transform::Malformed(_)));
    }

    #[test]
    fn test_transform_missing_event_date_time_is_malformed() {
        let raw = body(&json!({
            "event_type": "user.created",
        }));

        assert!(matches!(transform(&raw), Transform::Malformed(_)));
    }

    #[test]
    fn test_transform_non_json_is_malformed() {
        assert!(matches!(transform(b"not json"), Transform::Malformed(_)));
    }

    #[test]
    fn test_transform_non_object_is_malformed() {
        assert!(matches!(transform(b"[1,2,3]"), Transform::Malformed(_)));
    }

    #[test]
    fn test_transform_uses_explicit_id_when_present() {
        let raw = body(&json!({
            "id": 42,
            "event_date_time": "2026-01-15T09:30:00Z",
            "event_type": "user.created",
        }));

        let Transform::Event(record) = transform(&raw) else {
            panic!("expected an event");
        };
        assert_eq!(record.id, 42);
    }

    #[test]
    fn test_transform_derives_stable_id_without_explicit_id() {
        let raw = body(&json!({
            "event_date_time": "2026-01-15T09:30:00Z",
            "event_type": "user.created",
        }));

        let Transform::Event(first) = transform(&raw) else {
            panic!("expected an event");
        };
        let Transform::Event(second) = transform(&raw) else {
            panic!("expected an event");
        };

        assert_eq!(first.id, second.id);
        assert!(first.id >= 0);
    }

    #[test]
    fn test_parse_event_timestamp_formats() {
        assert!(parse_event_timestamp("2026-01-15T09:30:00Z").is_some());
        assert!(parse_event_timestamp("2026-01-15 09:30:00.123456").is_some());
        assert!(parse_event_timestamp("2026-01-15 09:30:00").is_some());
        assert!(parse_event_timestamp("yesterday").is_none());
    }
}
