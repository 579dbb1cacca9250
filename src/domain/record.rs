use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as delivered by the bus client, before any parsing.
///
/// Lives only between the bus callback and the decoder.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// A normalized sensor reading.
///
/// All sensor fields are independently optional: devices report partial
/// telemetry. `timestamp` is always present, falling back to arrival time
/// when the payload carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    pub topic: String,
    pub distance: Option<f64>,
    pub motion: Option<bool>,
    pub lid_status: Option<String>,
    pub waste_level: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_seq: Option<u64>,
}

impl SensorRecord {
    /// Deterministic idempotency key for storage upserts.
    ///
    /// Redelivery of the same logical message (same topic, timestamp and
    /// sequence number) maps to the same key, so duplicates overwrite
    /// instead of accumulating.
    pub fn document_key(&self) -> String {
        match self.source_seq {
            Some(seq) => format!(
                "{}|{}|{}",
                self.topic,
                self.timestamp.timestamp_millis(),
                seq
            ),
            None => format!("{}|{}", self.topic, self.timestamp.timestamp_millis()),
        }
    }

    /// The document shape persisted to storage. Absent sensor fields are
    /// stored as explicit nulls.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "topic": self.topic,
            "distance": self.distance,
            "motion": self.motion,
            "lidStatus": self.lid_status,
            "wasteLevel": self.waste_level,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Why a message was rejected at the decode boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MalformedJson,
    SchemaViolation,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MalformedJson => f.write_str("malformed JSON"),
            RejectReason::SchemaViolation => f.write_str("schema violation"),
        }
    }
}

/// A message that failed decoding. Terminal: counted and logged, never
/// retried, since malformation is not transient.
#[derive(Debug, Clone)]
pub struct RejectedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub reason: RejectReason,
    pub occurred_at: DateTime<Utc>,
}
