//! Synchronous fan-out of messages to registered consumers.
//!
//! ## Delivery model
//!
//! - Consumers are visited in **registration order**, one at a time: each
//!   consumer finishes before the next starts, so projections observe the
//!   same causal order as the log.
//! - Each consumer has its own [`MessageFilter`]; a rejected message is
//!   skipped for that consumer only.
//! - The dispatcher adds no locking of its own. Latency of a consumer's side
//!   effect (e.g. writing a read model) is simply the latency of `dispatch`.
//!
//! ## Failure policy
//!
//! - [`FailurePolicy::FailFast`] (default): the first consumer error aborts the
//!   remaining deliveries for that message and is returned to the caller.
//! - [`FailurePolicy::CollectAndContinue`]: every consumer runs; all failures
//!   are returned together.
//!
//! Either way, failures are always returned. A read model that silently
//! misses an event is corrupt.
//!
//! Queued/asynchronous delivery is a separate layer wrapping this type, not a
//! mode of it.

use thiserror::Error;
use tracing::{trace, warn};

use crate::filter::{AlwaysAllowingMessageFilter, MessageFilter};
use crate::handler::EnvelopeHandler;

/// How `dispatch` reacts to a consumer failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    CollectAndContinue,
}

/// A consumer's error, tagged with which consumer raised it.
#[derive(Debug, Error)]
#[error("consumer `{consumer}` (#{index}) failed: {source}")]
pub struct ConsumerDeliveryFailure {
    pub consumer: String,
    /// Registration index of the failing consumer.
    pub index: usize,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Delivery(ConsumerDeliveryFailure),

    #[error("{} consumer(s) failed", .0.len())]
    Collected(Vec<ConsumerDeliveryFailure>),
}

impl DispatchError {
    /// All failures carried by this error.
    pub fn failures(&self) -> &[ConsumerDeliveryFailure] {
        match self {
            DispatchError::Delivery(f) => core::slice::from_ref(f),
            DispatchError::Collected(fs) => fs,
        }
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
}

struct Registration<M> {
    handler: Box<dyn EnvelopeHandler<M>>,
    filter: Box<dyn MessageFilter<M>>,
}

/// Delivers messages to consumers, synchronously and in registration order.
pub struct MessageDispatcher<M> {
    registrations: Vec<Registration<M>>,
    policy: FailurePolicy,
}

impl<M> MessageDispatcher<M> {
    pub fn new() -> Self {
        Self::with_policy(FailurePolicy::default())
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            registrations: Vec::new(),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Register a consumer that receives every message.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: EnvelopeHandler<M> + 'static,
    {
        self.register_filtered(handler, AlwaysAllowingMessageFilter)
    }

    /// Register a consumer guarded by `filter`.
    pub fn register_filtered<H, F>(&mut self, handler: H, filter: F) -> &mut Self
    where
        H: EnvelopeHandler<M> + 'static,
        F: MessageFilter<M> + 'static,
    {
        self.registrations.push(Registration {
            handler: Box::new(handler),
            filter: Box::new(filter),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Deliver `message` to every consumer whose filter allows it.
    pub fn dispatch(&self, message: &M) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let mut failures = Vec::new();

        for (index, reg) in self.registrations.iter().enumerate() {
            let consumer = reg.handler.name();
            if !reg.filter.allows(message) {
                report.skipped += 1;
                continue;
            }

            trace!(consumer, index, "delivering message");
            match reg.handler.handle(message) {
                Ok(()) => report.delivered += 1,
                Err(source) => {
                    warn!(consumer, index, error = %source, "consumer failed");
                    let failure = ConsumerDeliveryFailure {
                        consumer: consumer.to_string(),
                        index,
                        source,
                    };
                    match self.policy {
                        FailurePolicy::FailFast => return Err(DispatchError::Delivery(failure)),
                        FailurePolicy::CollectAndContinue => failures.push(failure),
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(DispatchError::Collected(failures))
        }
    }

    /// Dispatch messages in order, stopping at the first message that fails.
    pub fn dispatch_all<'a, I>(&self, messages: I) -> Result<DispatchReport, DispatchError>
    where
        I: IntoIterator<Item = &'a M>,
        M: 'a,
    {
        let mut total = DispatchReport::default();
        for message in messages {
            let report = self.dispatch(message)?;
            total.delivered += report.delivered;
            total.skipped += report.skipped;
        }
        Ok(total)
    }
}

impl<M> Default for MessageDispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> core::fmt::Debug for MessageDispatcher<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.registrations.iter().map(|r| r.handler.name()).collect();
        f.debug_struct("MessageDispatcher")
            .field("consumers", &names)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use chronicle_core::AggregateId;

    use super::*;
    use crate::envelope::{EventEnvelope, RecordedEvent};
    use crate::filter::{Filter, NeverAllowingMessageFilter};
    use crate::handler::handler_fn;
    use crate::payload::Payload;

    /// Records the sequence numbers it receives.
    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn named(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EnvelopeHandler<RecordedEvent> for Recorder {
        fn handle(&self, message: &RecordedEvent) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(message.sequence_number());
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn envelopes(n: u64) -> Vec<RecordedEvent> {
        let id = AggregateId::parse("stream-1").unwrap();
        (1..=n)
            .map(|seq| {
                EventEnvelope::new(id.clone(), seq, seq, "thing.happened", Utc::now(), Payload::new())
            })
            .collect()
    }

    fn failing(name: &'static str) -> impl EnvelopeHandler<RecordedEvent> {
        handler_fn(name, |_: &RecordedEvent| Err(anyhow::anyhow!("read model unavailable")))
    }

    #[test]
    fn never_allow_consumer_receives_nothing() {
        let muted = Recorder::named("muted");
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register_filtered(muted.clone(), NeverAllowingMessageFilter);

        for env in envelopes(10) {
            let report = dispatcher.dispatch(&env).unwrap();
            assert_eq!(report, DispatchReport { delivered: 0, skipped: 1 });
        }
        assert!(muted.seen().is_empty());
    }

    #[test]
    fn always_allow_consumer_receives_everything_in_order() {
        let all = Recorder::named("all");
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register(all.clone());

        let report = dispatcher.dispatch_all(&envelopes(5)).unwrap();
        assert_eq!(report.delivered, 5);
        assert_eq!(all.seen(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn consumers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MessageDispatcher::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            dispatcher.register(handler_fn(name, move |_: &RecordedEvent| {
                order.lock().unwrap().push(name);
                Ok(())
            }));
        }

        dispatcher.dispatch(&envelopes(1)[0]).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn fail_fast_stops_later_consumers_and_surfaces_error() {
        let before = Recorder::named("before");
        let after = Recorder::named("after");
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(before.clone())
            .register(failing("broken"))
            .register(after.clone());

        let err = dispatcher.dispatch(&envelopes(1)[0]).unwrap_err();
        match err {
            DispatchError::Delivery(f) => {
                assert_eq!(f.consumer, "broken");
                assert_eq!(f.index, 1);
                assert!(f.to_string().contains("read model unavailable"));
            }
            other => panic!("expected fail-fast delivery error, got {other:?}"),
        }
        assert_eq!(before.seen(), vec![1]);
        assert!(after.seen().is_empty());
    }

    #[test]
    fn collect_and_continue_runs_everyone() {
        let after = Recorder::named("after");
        let mut dispatcher = MessageDispatcher::with_policy(FailurePolicy::CollectAndContinue);
        dispatcher
            .register(failing("a"))
            .register(after.clone())
            .register(failing("b"));

        let err = dispatcher.dispatch(&envelopes(1)[0]).unwrap_err();
        let names: Vec<&str> = err.failures().iter().map(|f| f.consumer.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(after.seen(), vec![1]);
    }

    #[test]
    fn type_filters_route_messages() {
        let placed = Recorder::named("placed");
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register_filtered(placed.clone(), Filter::event_type("order.placed"));

        let id = AggregateId::parse("o").unwrap();
        let a = EventEnvelope::new(id.clone(), 1, 1, "order.placed", Utc::now(), Payload::new());
        let b = EventEnvelope::new(id, 2, 2, "order.shipped", Utc::now(), Payload::new());
        dispatcher.dispatch_all([&a, &b]).unwrap();

        assert_eq!(placed.seen(), vec![1]);
    }

    #[test]
    fn dispatch_all_stops_at_first_failed_message() {
        let seen = Recorder::named("seen");
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register(seen.clone()).register(handler_fn(
            "fails-on-3",
            |m: &RecordedEvent| {
                if m.sequence_number() == 3 {
                    anyhow::bail!("boom");
                }
                Ok(())
            },
        ));

        assert!(dispatcher.dispatch_all(&envelopes(5)).is_err());
        assert_eq!(seen.seen(), vec![1, 2, 3]);
    }
}
