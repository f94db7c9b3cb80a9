//! Infrastructure layer: event stores, the typed event log, the concurrency
//! guard and background dispatch.

pub mod concurrency;
pub mod config;
pub mod event_log;
pub mod event_store;
pub mod workers;

pub use concurrency::{ConcurrencyGuard, GuardError};
pub use config::{MissingStreamPolicy, StoreConfig};
pub use event_log::EventLog;
pub use event_store::{
    ConcurrencyConflict, DispatchingEventStore, EventStore, EventStoreError, EventStream,
    InMemoryEventStore, NewEvent, PostgresEventStore, PublishingEventStore,
};
pub use workers::{QueuedDispatcher, WorkerHandle};

#[cfg(test)]
mod test_fixtures;

#[cfg(test)]
mod integration_tests;
