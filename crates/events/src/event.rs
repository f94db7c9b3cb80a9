use chrono::{DateTime, Utc};

use crate::codec::CodecError;
use crate::payload::Payload;

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts; equality is structural)
/// - **self-describing** (a stable type tag routes them back to a decoder)
/// - **timestamped** (the time the fact was recorded)
///
/// Encoding is part of the contract; decoding is the separate, type-indexed
/// [`DecodeEvent`] capability registered with an
/// [`EventCodec`](crate::EventCodec).
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "order.placed").
    fn event_type(&self) -> &'static str;

    /// When the event was recorded (business time).
    fn recorded_at(&self) -> DateTime<Utc>;

    /// Flatten the domain fields into a JSON-compatible mapping.
    ///
    /// The recorded time is carried by the envelope and must not be repeated
    /// here.
    fn to_payload(&self) -> Result<Payload, CodecError>;
}

/// Decoder half of the event contract, indexed by type tag.
pub trait DecodeEvent: Sized {
    /// Type tag this decoder handles. Must equal `Event::event_type()` of the
    /// values it produces.
    const EVENT_TYPE: &'static str;

    /// Rebuild an event from its payload and recorded time.
    fn from_payload(payload: Payload, recorded_at: DateTime<Utc>) -> Result<Self, CodecError>;
}
