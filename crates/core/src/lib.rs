//! `chronicle-core` — foundation building blocks shared by the event log.
//!
//! This crate contains **pure** primitives (no storage or transport concerns):
//! identifiers, optimistic concurrency expectations and the aggregate traits.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::AggregateId;
