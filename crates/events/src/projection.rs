use crate::EventEnvelope;

/// A projection folds envelopes into a read model.
///
/// Read models are **disposable**: the log is the source of truth and a
/// projection can always be rebuilt by replaying `read_all` from position 0.
///
/// `apply` is infallible on purpose. Events that are irrelevant to the
/// projection are ignored; anything that can genuinely fail (a write to a
/// separate store) belongs in an [`EnvelopeHandler`](crate::EnvelopeHandler),
/// whose errors the dispatcher surfaces.
pub trait Projection {
    type Ev;

    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
