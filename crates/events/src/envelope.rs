use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::AggregateId;

use crate::payload::Payload;

/// Envelope for an event, containing stream positioning metadata.
///
/// This is the unit you persist to, and read back from, an event stream.
///
/// Notes:
/// - **Append-only**: `sequence_number` starts at 1 and increases by one per
///   event within an aggregate's stream.
/// - `global_position` orders envelopes across all aggregates by commit order.
/// - `payload` is the codec-level representation (a [`Payload`] by default) or
///   a decoded domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<P = Payload> {
    aggregate_id: AggregateId,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    /// Position in the store-wide append order.
    global_position: u64,

    #[serde(rename = "typeTag")]
    event_type: String,

    #[serde(rename = "recordedTime", with = "recorded_time")]
    recorded_at: DateTime<Utc>,

    payload: P,
}

/// An envelope exactly as stored: undecoded payload.
pub type RecordedEvent = EventEnvelope<Payload>;

impl<P> EventEnvelope<P> {
    pub fn new(
        aggregate_id: AggregateId,
        sequence_number: u64,
        global_position: u64,
        event_type: impl Into<String>,
        recorded_at: DateTime<Utc>,
        payload: P,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            global_position,
            event_type: event_type.into(),
            recorded_at,
            payload,
        }
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn global_position(&self) -> u64 {
        self.global_position
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Replace the payload, keeping all positioning metadata.
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> EventEnvelope<Q> {
        EventEnvelope {
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            global_position: self.global_position,
            event_type: self.event_type,
            recorded_at: self.recorded_at,
            payload: f(self.payload),
        }
    }
}

/// ISO-8601 timestamps with microsecond precision and a `Z` suffix.
mod recorded_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
