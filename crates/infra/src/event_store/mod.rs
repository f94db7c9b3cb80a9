//! Append-only event store boundary.
//!
//! [`EventStore`] is the storage abstraction; [`InMemoryEventStore`] and
//! [`PostgresEventStore`] implement it. The adapters below wrap any store and
//! forward committed envelopes to consumers, either in-process
//! ([`DispatchingEventStore`]) or through a bus ([`PublishingEventStore`]).
//!
//! Both adapters keep one ordering rule: **consumers only ever see envelopes
//! whose append already succeeded**. A failure after the commit never rolls
//! the commit back.

pub mod cursor;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use cursor::{CursorKey, PagedCursor};
pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    ConcurrencyConflict, EventStore, EventStoreError, EventStream, NewEvent, collect_stream,
    empty_stream,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

use chronicle_core::{AggregateId, ExpectedVersion};
use chronicle_events::{EventBus, MessageDispatcher, RecordedEvent};
use tracing::warn;

/// Serializes append + delivery so consumers see envelopes in global order.
///
/// The lock guards no data, so a poisoned lock is simply taken over.
#[derive(Debug, Default)]
struct DeliveryOrder(Mutex<()>);

impl DeliveryOrder {
    fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adapter that dispatches committed envelopes synchronously after append.
///
/// `append` returns only after every consumer ran. If a consumer fails, the
/// events stay committed and the error comes back as
/// [`EventStoreError::Dispatch`]; callers must not retry the append.
///
/// Appends through this adapter are serialized together with their dispatch,
/// so consumers receive envelopes in global position order even when
/// different aggregates are written from different threads.
pub struct DispatchingEventStore<S> {
    store: S,
    dispatcher: MessageDispatcher<RecordedEvent>,
    order: DeliveryOrder,
}

impl<S> DispatchingEventStore<S> {
    pub fn new(store: S, dispatcher: MessageDispatcher<RecordedEvent>) -> Self {
        Self {
            store,
            dispatcher,
            order: DeliveryOrder::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatcher(&self) -> &MessageDispatcher<RecordedEvent> {
        &self.dispatcher
    }

    pub fn into_parts(self) -> (S, MessageDispatcher<RecordedEvent>) {
        (self.store, self.dispatcher)
    }
}

impl<S: core::fmt::Debug> core::fmt::Debug for DispatchingEventStore<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchingEventStore")
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl<S: EventStore> EventStore for DispatchingEventStore<S> {
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let _order = self.order.hold();
        let committed = self.store.append(aggregate_id, expected_version, events)?;

        if let Err(err) = self.dispatcher.dispatch_all(&committed) {
            warn!(
                aggregate_id = %aggregate_id,
                failures = err.failures().len(),
                "events committed but dispatch failed"
            );
            return Err(EventStoreError::Dispatch(err));
        }

        Ok(committed)
    }

    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_stream(aggregate_id, from_version)
    }

    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_all(from_position)
    }

    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError> {
        self.store.stream_version(aggregate_id)
    }
}

/// Adapter that publishes committed envelopes to an `EventBus` after a successful append.
///
/// Publishing is best-effort: a failed publish surfaces as `Storage` but the
/// events stay committed. Subscribers that missed envelopes catch up with
/// `read_all`. Like [`DispatchingEventStore`], append and publish are
/// serialized so the bus carries envelopes in global position order.
#[derive(Debug)]
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
    order: DeliveryOrder,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            order: DeliveryOrder::default(),
        }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<RecordedEvent>,
{
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let _order = self.order.hold();
        let committed = self.store.append(aggregate_id, expected_version, events)?;

        for envelope in &committed {
            self.bus.publish(envelope.clone()).map_err(|err| {
                EventStoreError::storage(format!(
                    "events committed but publish failed at position {}: {err:?}",
                    envelope.global_position()
                ))
            })?;
        }

        Ok(committed)
    }

    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_stream(aggregate_id, from_version)
    }

    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        self.store.read_all(from_position)
    }

    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError> {
        self.store.stream_version(aggregate_id)
    }
}
