//! Message filters: per-consumer routing predicates.
//!
//! A filter decides whether one consumer receives one message. Filters are
//! stateless and pure; the [`MessageDispatcher`](crate::MessageDispatcher) asks
//! them before every delivery.

use std::collections::BTreeSet;

use chronicle_core::AggregateId;

use crate::envelope::EventEnvelope;

/// Routing predicate over messages of type `M`.
pub trait MessageFilter<M>: Send + Sync {
    fn allows(&self, message: &M) -> bool;
}

impl<M, F> MessageFilter<M> for std::sync::Arc<F>
where
    F: MessageFilter<M> + ?Sized,
{
    fn allows(&self, message: &M) -> bool {
        (**self).allows(message)
    }
}

/// Lets every message through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlwaysAllowingMessageFilter;

impl<M> MessageFilter<M> for AlwaysAllowingMessageFilter {
    fn allows(&self, _message: &M) -> bool {
        true
    }
}

/// Rejects every message.
///
/// Useful for muting a consumer (during a migration, in a test) without
/// unregistering it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeverAllowingMessageFilter;

impl<M> MessageFilter<M> for NeverAllowingMessageFilter {
    fn allows(&self, _message: &M) -> bool {
        false
    }
}

/// Closed set of filters over envelopes.
///
/// `AnyOf` of nothing rejects, `AllOf` of nothing allows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    AlwaysAllow,
    NeverAllow,
    /// Matches a single type tag.
    EventType(String),
    /// Matches any of the given type tags.
    EventTypes(BTreeSet<String>),
    /// Matches envelopes of one aggregate.
    Aggregate(AggregateId),
    AnyOf(Vec<Filter>),
    AllOf(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn event_type(type_tag: impl Into<String>) -> Self {
        Filter::EventType(type_tag.into())
    }

    pub fn event_types<I, S>(type_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::EventTypes(type_tags.into_iter().map(Into::into).collect())
    }

    pub fn aggregate(aggregate_id: AggregateId) -> Self {
        Filter::Aggregate(aggregate_id)
    }

    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::AnyOf(filters.into_iter().collect())
    }

    pub fn all_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::AllOf(filters.into_iter().collect())
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against the routing-relevant parts of a message.
    pub fn matches(&self, aggregate_id: &AggregateId, event_type: &str) -> bool {
        match self {
            Filter::AlwaysAllow => true,
            Filter::NeverAllow => false,
            Filter::EventType(t) => t == event_type,
            Filter::EventTypes(ts) => ts.contains(event_type),
            Filter::Aggregate(id) => id == aggregate_id,
            Filter::AnyOf(fs) => fs.iter().any(|f| f.matches(aggregate_id, event_type)),
            Filter::AllOf(fs) => fs.iter().all(|f| f.matches(aggregate_id, event_type)),
            Filter::Not(f) => !f.matches(aggregate_id, event_type),
        }
    }
}

impl<P> MessageFilter<EventEnvelope<P>> for Filter {
    fn allows(&self, message: &EventEnvelope<P>) -> bool {
        self.matches(message.aggregate_id(), message.event_type())
    }
}
