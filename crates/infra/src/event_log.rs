//! Typed façade over an [`EventStore`].
//!
//! The store speaks envelopes and payloads; the log speaks domain events. It
//! owns the [`EventCodec`] for one event sum type and does the encoding on the
//! way in and the decoding on the way out.

use tracing::instrument;

use chronicle_core::{AggregateId, ExpectedVersion};
use chronicle_events::{Event, EventCodec, EventEnvelope, RecordedEvent};

use crate::event_store::{EventStore, EventStoreError, EventStream, NewEvent};

/// Event log for events of type `E`, stored in `S`.
#[derive(Debug, Clone)]
pub struct EventLog<S, E> {
    store: S,
    codec: EventCodec<E>,
}

impl<S, E> EventLog<S, E>
where
    S: EventStore,
    E: Event,
{
    pub fn new(store: S, codec: EventCodec<E>) -> Self {
        Self { store, codec }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> &EventCodec<E> {
        &self.codec
    }

    /// Append `events` and return the new stream version.
    pub fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: &[E],
    ) -> Result<u64, EventStoreError> {
        let committed = self.append_committed(aggregate_id, expected_version, events)?;
        committed
            .last()
            .map(|e| e.sequence_number())
            .ok_or(EventStoreError::EmptyAppend)
    }

    /// Append `events` and return the committed envelopes.
    ///
    /// The whole batch is encoded before the store is touched, so an event
    /// that fails to encode leaves the stream unchanged.
    #[instrument(
        skip(self, events),
        fields(aggregate_id = %aggregate_id, expected_version = %expected_version, event_count = events.len()),
        err(level = "warn")
    )]
    pub fn append_committed(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: &[E],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let encoded = events
            .iter()
            .map(|e| NewEvent::encode(&self.codec, e))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.append(aggregate_id, expected_version, encoded)
    }

    pub fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_stream(aggregate_id, from_version)
    }

    pub fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_all(from_position)
    }

    /// Decoded envelopes of one aggregate after `from_version`.
    pub fn load(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope<E>>, EventStoreError> {
        self.store
            .read_stream(aggregate_id, from_version)?
            .map(|item| -> Result<EventEnvelope<E>, EventStoreError> {
                Ok(self.codec.decode_envelope(&item?)?)
            })
            .collect()
    }

    /// Current version of the stream, 0 if it does not exist.
    pub fn version(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError> {
        Ok(self.store.stream_version(aggregate_id)?.unwrap_or(0))
    }
}
