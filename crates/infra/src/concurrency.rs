//! Optimistic concurrency for aggregate-based writers.
//!
//! The guard reads the aggregate's version, lets it decide, and appends with
//! `ExpectedVersion::Exact(version)`. If another writer got there first the
//! append is rejected as a [`GuardError::Conflict`] and nothing changes, in
//! the store or in the caller's aggregate. Retrying (reload, decide again) is
//! the caller's call.

use thiserror::Error;
use tracing::{debug, warn};

use chronicle_core::{Aggregate, AggregateId, AggregateRoot, ExpectedVersion};
use chronicle_events::{CodecError, DispatchError, Event};

use crate::event_log::EventLog;
use crate::event_store::{ConcurrencyConflict, EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum GuardError {
    /// Another writer appended first. Reload and retry.
    #[error(transparent)]
    Conflict(ConcurrencyConflict),

    /// The aggregate rejected the command.
    #[error("command rejected: {0}")]
    Domain(String),

    #[error(transparent)]
    Codec(CodecError),

    #[error(transparent)]
    Store(EventStoreError),

    /// The events are committed at `version` but a consumer failed.
    ///
    /// Not retriable: running the command again would record it twice. The
    /// aggregate passed to `execute` has already been brought to `version`.
    #[error("aggregate `{aggregate_id}` committed at version {version} but dispatch failed: {source}")]
    CommittedButUndelivered {
        aggregate_id: AggregateId,
        version: u64,
        #[source]
        source: DispatchError,
    },

    /// Applying history did not bring the aggregate to the stream's version.
    #[error(
        "aggregate `{aggregate_id}` rehydrated to version {aggregate_version} \
         but the stream is at {stream_version}"
    )]
    VersionMismatch {
        aggregate_id: AggregateId,
        aggregate_version: u64,
        stream_version: u64,
    },
}

impl GuardError {
    /// True only for conflicts: the command may succeed against fresh state.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GuardError::Conflict(_))
    }
}

impl From<EventStoreError> for GuardError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Concurrency(conflict) => GuardError::Conflict(conflict),
            EventStoreError::Codec(codec) => GuardError::Codec(codec),
            other => GuardError::Store(other),
        }
    }
}

/// Runs aggregate commands against an [`EventLog`] with optimistic
/// concurrency.
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard<S, E> {
    log: EventLog<S, E>,
}

impl<S, E> ConcurrencyGuard<S, E>
where
    S: EventStore,
    E: Event,
{
    pub fn new(log: EventLog<S, E>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &EventLog<S, E> {
        &self.log
    }

    /// Append `events` on behalf of `aggregate`, expecting the stream to be
    /// exactly at `aggregate.version()`. Returns the new version.
    pub fn append_for<A: AggregateRoot>(&self, aggregate: &A, events: &[E]) -> Result<u64, GuardError> {
        let expected = ExpectedVersion::Exact(aggregate.version());
        self.log
            .append(aggregate.id(), expected, events)
            .map_err(|err| match err {
                // An exact expectation that committed lands on a known version.
                EventStoreError::Dispatch(source) => GuardError::CommittedButUndelivered {
                    aggregate_id: aggregate.id().clone(),
                    version: aggregate.version() + events.len() as u64,
                    source,
                },
                other => GuardError::from(other),
            })
    }

    /// Decide, append, then apply.
    ///
    /// The aggregate only sees the new events once they are committed; a
    /// rejected command or a conflict leaves it untouched. If the events
    /// commit but a consumer fails, they are still applied before
    /// `CommittedButUndelivered` is returned. An empty decision appends
    /// nothing and returns the current version.
    pub fn execute<A>(&self, aggregate: &mut A, command: &A::Command) -> Result<u64, GuardError>
    where
        A: Aggregate<Event = E>,
    {
        let events = aggregate
            .handle(command)
            .map_err(|e| GuardError::Domain(format!("{e:?}")))?;

        if events.is_empty() {
            return Ok(aggregate.version());
        }

        match self.append_for(aggregate, &events) {
            Ok(version) => {
                for event in &events {
                    aggregate.apply(event);
                }
                debug!(aggregate_id = %aggregate.id(), version, "command committed");
                Ok(version)
            }
            Err(err @ GuardError::CommittedButUndelivered { .. }) => {
                for event in &events {
                    aggregate.apply(event);
                }
                warn!(aggregate_id = %aggregate.id(), error = %err, "command committed but not delivered");
                Err(err)
            }
            Err(err) => {
                if err.is_retriable() {
                    warn!(aggregate_id = %aggregate.id(), error = %err, "command lost a concurrent write");
                }
                Err(err)
            }
        }
    }

    /// Build an aggregate from its stored history.
    ///
    /// `factory` creates the empty aggregate for `aggregate_id`; every stored
    /// event is then applied in sequence order.
    pub fn rehydrate<A>(
        &self,
        aggregate_id: &AggregateId,
        factory: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, GuardError>
    where
        A: Aggregate<Event = E>,
    {
        let history = self.log.load(aggregate_id, 0)?;
        let mut aggregate = factory(aggregate_id.clone());
        let stream_version = history.last().map(|e| e.sequence_number()).unwrap_or(0);

        for envelope in &history {
            aggregate.apply(envelope.payload());
        }

        if aggregate.version() != stream_version {
            return Err(GuardError::VersionMismatch {
                aggregate_id: aggregate_id.clone(),
                aggregate_version: aggregate.version(),
                stream_version,
            });
        }
        Ok(aggregate)
    }
}
