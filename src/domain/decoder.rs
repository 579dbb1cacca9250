use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::domain::record::{RejectReason, RejectedMessage, SensorRecord};

/// Decodes a raw payload into a normalized record.
///
/// Pure and total: every input yields exactly one of the two variants.
/// Missing or wrong-typed sensor fields map to `None`, never to a rejection;
/// partial telemetry is valid. Only an unparseable payload, a non-object
/// payload or an empty topic rejects the message.
pub fn decode(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<SensorRecord, RejectedMessage> {
    let reject = |reason| RejectedMessage {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        reason,
        occurred_at: received_at,
    };

    if topic.is_empty() {
        return Err(reject(RejectReason::SchemaViolation));
    }

    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return Err(reject(RejectReason::MalformedJson)),
    };

    let fields = match value.as_object() {
        Some(fields) => fields,
        None => return Err(reject(RejectReason::SchemaViolation)),
    };

    let timestamp = fields
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Ok(SensorRecord {
        topic: topic.to_string(),
        distance: fields.get("distance").and_then(Value::as_f64),
        motion: fields.get("motion").and_then(Value::as_bool),
        lid_status: fields
            .get("lidStatus")
            .and_then(Value::as_str)
            .map(str::to_string),
        waste_level: fields.get("wasteLevel").and_then(Value::as_f64),
        timestamp,
        source_seq: fields.get("seq").and_then(Value::as_u64),
    })
}

/// Accepts RFC 3339 strings and epoch numbers. Numbers at or above 1e11 are
/// taken as milliseconds, below as seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(_) => {
            let epoch = value.as_i64()?;
            if epoch >= 100_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            }
        }
        _ => None,
    }
}
