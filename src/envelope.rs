use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub source: String,
    pub event_id: String,
    pub event_type: String,
    pub received_at: String,
    pub payload: Value,
}

pub fn build_envelope(
    source: &str,
    event_id: String,
    event_type: String,
    payload: Value,
    received_at_epoch_ms: i64,
) -> EventEnvelope {
    let received_at =
        DateTime::<Utc>::from_timestamp_millis(received_at_epoch_ms).unwrap_or_default();

    EventEnvelope {
        id: Uuid::new_v4().to_string(),
        source: source.to_string(),
        event_id,
        event_type,
        received_at: received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        payload,
    }
}
