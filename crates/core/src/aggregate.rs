//! Aggregate traits and optimistic concurrency expectations.

use serde::{Deserialize, Serialize};

use crate::id::AggregateId;

/// Aggregate root marker + minimal interface.
///
/// The version is what callers hand to the log as their expected version, so
/// it must equal the sequence number of the last event applied (0 for a new
/// aggregate).
pub trait AggregateRoot {
    /// Returns the aggregate identifier.
    fn id(&self) -> &AggregateId;

    /// Sequence number of the last event applied to this in-memory state.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an append.
///
/// `Exact(0)` means "the stream must not exist yet".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip version checking (migrations, imports).
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        ExpectedVersion::Exact(value)
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO. `apply` must advance `version()` by one
/// per event so the next append expects the right sequence number.
pub trait Aggregate: AggregateRoot {
    type Command: core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}
