//! Event codec: typed events ⇄ (type tag, payload).
//!
//! Encoding is driven by the [`Event`] trait of the value itself. Decoding is
//! looked up by type tag in a registry, so a single codec can rebuild any of
//! the event types an aggregate (or projection) understands into one sum type.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::envelope::{EventEnvelope, RecordedEvent};
use crate::event::{DecodeEvent, Event};
use crate::payload::Payload;

/// Codec-level failure.
///
/// Neither variant is recoverable by retrying: they require a code fix or a
/// schema migration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("no decoder registered for event type `{type_tag}`")]
    UnknownTypeTag { type_tag: String },

    #[error("malformed payload for event type `{type_tag}`: {reason}")]
    MalformedPayload { type_tag: String, reason: String },
}

impl CodecError {
    pub fn unknown(type_tag: impl Into<String>) -> Self {
        Self::UnknownTypeTag {
            type_tag: type_tag.into(),
        }
    }

    pub fn malformed(type_tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            type_tag: type_tag.into(),
            reason: reason.into(),
        }
    }
}

type DecodeFn<E> = Arc<dyn Fn(Payload, DateTime<Utc>) -> Result<E, CodecError> + Send + Sync>;

/// Registry of decoders producing events of type `E`.
pub struct EventCodec<E> {
    decoders: HashMap<String, DecodeFn<E>>,
}

impl<E> EventCodec<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the decoder of `T` under `T::EVENT_TYPE`.
    ///
    /// Registering a tag twice replaces the earlier decoder.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: DecodeEvent + Into<E> + 'static,
    {
        self.register_fn(T::EVENT_TYPE, |payload, recorded_at| {
            T::from_payload(payload, recorded_at).map(Into::into)
        })
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<T>(mut self) -> Self
    where
        T: DecodeEvent + Into<E> + 'static,
    {
        self.register::<T>();
        self
    }

    /// Register a hand-written decoder for `type_tag`.
    pub fn register_fn<F>(&mut self, type_tag: impl Into<String>, decode: F) -> &mut Self
    where
        F: Fn(Payload, DateTime<Utc>) -> Result<E, CodecError> + Send + Sync + 'static,
    {
        let type_tag = type_tag.into();
        if self
            .decoders
            .insert(type_tag.clone(), Arc::new(decode))
            .is_some()
        {
            debug!(event_type = %type_tag, "replaced previously registered decoder");
        }
        self
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    /// Registered type tags, sorted.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Rebuild an event from its stored representation.
    pub fn decode(
        &self,
        type_tag: &str,
        payload: Payload,
        recorded_at: DateTime<Utc>,
    ) -> Result<E, CodecError> {
        let decode = self
            .decoders
            .get(type_tag)
            .ok_or_else(|| CodecError::unknown(type_tag))?;
        decode(payload, recorded_at)
    }

    /// Decode the payload of a stored envelope, keeping its metadata.
    pub fn decode_envelope(&self, envelope: &RecordedEvent) -> Result<EventEnvelope<E>, CodecError> {
        let event = self.decode(
            envelope.event_type(),
            envelope.payload().clone(),
            envelope.recorded_at(),
        )?;
        Ok(envelope.clone().map_payload(|_| event))
    }
}

impl<E: Event> EventCodec<E> {
    /// Split an event into its type tag and payload.
    pub fn encode(&self, event: &E) -> Result<(String, Payload), CodecError> {
        let payload = event.to_payload()?;
        Ok((event.event_type().to_string(), payload))
    }
}

impl<E> Default for EventCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventCodec<E> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<E> core::fmt::Debug for EventCodec<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventCodec")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}
