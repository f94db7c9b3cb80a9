use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use chronicle_core::{AggregateId, ExpectedVersion};
use chronicle_events::{EventEnvelope, RecordedEvent};

use super::cursor::{CursorKey, PagedCursor};
use super::r#trait::{
    ConcurrencyConflict, EventStore, EventStoreError, EventStream, NewEvent, empty_stream,
};
use crate::config::{MissingStreamPolicy, StoreConfig};

type StreamHandle = Arc<RwLock<Vec<RecordedEvent>>>;

fn poisoned() -> EventStoreError {
    EventStoreError::storage("lock poisoned")
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for memory (envelopes are kept once
/// per stream and once in the global log).
///
/// ## Locking
///
/// - The stream map lock is held only to look up or create a stream.
/// - Each stream has its own lock; appends to one aggregate serialize on it,
///   and the version check happens while it is held.
/// - The global log lock is held only while positions are assigned and the
///   batch is pushed, so global order equals commit order.
///
/// Lock order is always stream → global log.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, StreamHandle>>,
    log: Arc<RwLock<Vec<RecordedEvent>>>,
    config: StoreConfig,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config: config.normalized(),
            ..Self::default()
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Total number of envelopes in the store.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing_stream(&self, aggregate_id: &AggregateId) -> Result<Option<StreamHandle>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams.get(aggregate_id).cloned())
    }

    fn stream_or_create(&self, aggregate_id: &AggregateId) -> Result<StreamHandle, EventStoreError> {
        if let Some(stream) = self.existing_stream(aggregate_id)? {
            return Ok(stream);
        }
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        Ok(streams.entry(aggregate_id.clone()).or_default().clone())
    }

    fn current_version(stream: &[RecordedEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number()).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend);
        }

        let handle = self.stream_or_create(aggregate_id)?;
        let mut stream = handle.write().map_err(|_| poisoned())?;
        let current = Self::current_version(&stream);

        if !expected_version.matches(current) {
            warn!(
                aggregate_id = %aggregate_id,
                expected = %expected_version,
                actual = current,
                "append rejected: concurrency conflict"
            );
            return Err(ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_version,
                actual: current,
            }
            .into());
        }

        let mut log = self.log.write().map_err(|_| poisoned())?;
        let mut position = log.len() as u64;
        let mut sequence = current;

        let committed: Vec<RecordedEvent> = events
            .into_iter()
            .map(|e| {
                position += 1;
                sequence += 1;
                EventEnvelope::new(
                    aggregate_id.clone(),
                    sequence,
                    position,
                    e.event_type,
                    e.recorded_at,
                    e.payload,
                )
            })
            .collect();

        log.extend(committed.iter().cloned());
        stream.extend(committed.iter().cloned());

        debug!(
            aggregate_id = %aggregate_id,
            count = committed.len(),
            version = sequence,
            "appended events"
        );
        Ok(committed)
    }

    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        let handle = self.existing_stream(aggregate_id)?;
        let version = match &handle {
            Some(h) => Self::current_version(&h.read().map_err(|_| poisoned())?),
            None => 0,
        };

        let handle = match handle {
            Some(h) if version > 0 => h,
            _ => {
                return match self.config.missing_streams {
                    MissingStreamPolicy::Error => Err(EventStoreError::StreamNotFound(aggregate_id.clone())),
                    MissingStreamPolicy::Empty => Ok(empty_stream()),
                };
            }
        };

        // Sequence numbers are dense from 1, so `after` is also a slice index.
        let cursor = PagedCursor::new(
            CursorKey::Sequence,
            from_version,
            version,
            self.config.page_size,
            move |after, limit| {
                let stream = handle.read().map_err(|_| poisoned())?;
                Ok(page(&stream, after, limit))
            },
        );
        Ok(Box::new(cursor))
    }

    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        let head = self.log.read().map_err(|_| poisoned())?.len() as u64;
        let log = self.log.clone();

        // Global positions are dense from 1 as well.
        let cursor = PagedCursor::new(
            CursorKey::Global,
            from_position,
            head,
            self.config.page_size,
            move |after, limit| {
                let log = log.read().map_err(|_| poisoned())?;
                Ok(page(&log, after, limit))
            },
        );
        Ok(Box::new(cursor))
    }

    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError> {
        let Some(handle) = self.existing_stream(aggregate_id)? else {
            return Ok(None);
        };
        let stream = handle.read().map_err(|_| poisoned())?;
        Ok(match Self::current_version(&stream) {
            0 => None,
            v => Some(v),
        })
    }
}

fn page(events: &[RecordedEvent], after: u64, limit: usize) -> Vec<RecordedEvent> {
    let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
    let end = start.saturating_add(limit).min(events.len());
    events[start..end].to_vec()
}
