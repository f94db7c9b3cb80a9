use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use chronicle_core::{AggregateId, ExpectedVersion};
use chronicle_events::{CodecError, DispatchError, Event, EventCodec, Payload, RecordedEvent};

/// An encoded event ready to be appended (no positions assigned yet).
///
/// The store assigns the sequence number and global position during append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: Payload,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, recorded_at: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            recorded_at,
            payload,
        }
    }

    /// Encode a typed event with `codec`.
    pub fn encode<E: Event>(codec: &EventCodec<E>, event: &E) -> Result<Self, CodecError> {
        let (event_type, payload) = codec.encode(event)?;
        Ok(Self {
            event_type,
            recorded_at: event.recorded_at(),
            payload,
        })
    }
}

/// The stream moved on since the caller last read it.
///
/// Recoverable: reload the aggregate, re-run the decision, append again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "concurrency conflict on `{aggregate_id}`: expected version {expected}, found {actual} \
     (hint: stream was modified; reload and retry)"
)]
pub struct ConcurrencyConflict {
    pub aggregate_id: AggregateId,
    pub expected: ExpectedVersion,
    pub actual: u64,
}

/// Event store operation error.
///
/// - `Concurrency`: optimistic check failed; nothing was written.
/// - `StreamNotFound`: only with `MissingStreamPolicy::Error`.
/// - `EmptyAppend`: an append must carry at least one event.
/// - `Codec`: an event could not be encoded/decoded; nothing was written.
/// - `Storage`: the backend failed (lock poisoning, database errors, rows in
///   an unexpected shape).
/// - `Dispatch`: events were committed, but a consumer failed afterwards.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),

    #[error("stream `{0}` not found")]
    StreamNotFound(AggregateId),

    #[error("cannot append an empty event batch")]
    EmptyAppend,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("events committed but dispatch failed: {0}")]
    Dispatch(#[source] DispatchError),
}

impl EventStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }
}

/// Lazy, finite sequence of envelopes.
///
/// Dropping it early is always safe: implementations hold no lock or
/// connection between items.
pub type EventStream<'a> = Box<dyn Iterator<Item = Result<RecordedEvent, EventStoreError>> + Send + 'a>;

/// Append-only event store.
///
/// ## Streams
///
/// One stream per aggregate identifier, created implicitly by the first
/// append. Sequence numbers within a stream are 1, 2, 3, ... with no gaps.
/// Global positions order every envelope in the store by commit.
///
/// ## Append semantics
///
/// `append()`:
/// - rejects empty batches
/// - checks `expected_version` against the stream's current version and
///   writes in one atomic step with respect to other appenders of that stream
/// - assigns sequence numbers starting at `current_version + 1`
/// - persists the batch all-or-nothing
///
/// Appends to different aggregates must not wait on each other beyond a
/// brief, store-internal critical section.
///
/// ## Read semantics
///
/// `read_stream()` / `read_all()` return lazy cursors that pull pages from the
/// store. They never block writers, see everything committed before the call,
/// and stop at the high-water mark observed when they were opened. Calling
/// again restarts from scratch.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream; returns the committed envelopes.
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Envelopes of one aggregate with `sequence_number > from_version`.
    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError>;

    /// Envelopes of every aggregate with `global_position > from_position`.
    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError>;

    /// Current version of a stream, `None` if it was never appended to.
    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        (**self).append(aggregate_id, expected_version, events)
    }

    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        (**self).read_stream(aggregate_id, from_version)
    }

    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        (**self).read_all(from_position)
    }

    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError> {
        (**self).stream_version(aggregate_id)
    }
}

/// A stream that yields nothing.
pub fn empty_stream<'a>() -> EventStream<'a> {
    Box::new(std::iter::empty::<Result<RecordedEvent, EventStoreError>>())
}

/// Drain a stream into a vector, stopping at the first error.
pub fn collect_stream(stream: EventStream<'_>) -> Result<Vec<RecordedEvent>, EventStoreError> {
    stream.collect()
}
