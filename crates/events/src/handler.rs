use std::sync::Arc;

use crate::codec::EventCodec;
use crate::envelope::{EventEnvelope, RecordedEvent};

/// Consumes messages and performs a side effect (projection update,
/// notification, outbound publish).
///
/// Handlers take `&self` so a single registration can be shared with other
/// parts of the program; handlers with mutable state keep it behind their own
/// lock. A returned error is a delivery failure and is surfaced by the
/// [`MessageDispatcher`](crate::MessageDispatcher).
pub trait EnvelopeHandler<M>: Send + Sync {
    fn handle(&self, message: &M) -> anyhow::Result<()>;

    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        "anonymous"
    }
}

impl<M, H> EnvelopeHandler<M> for Arc<H>
where
    H: EnvelopeHandler<M> + ?Sized,
{
    fn handle(&self, message: &M) -> anyhow::Result<()> {
        (**self).handle(message)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> core::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Wrap a closure as a named handler.
pub fn handler_fn<M, F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

impl<M, F> EnvelopeHandler<M> for FnHandler<F>
where
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, message: &M) -> anyhow::Result<()> {
        (self.f)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decodes stored envelopes before handing them to a typed handler.
///
/// Lets a handler written against domain events consume raw envelopes from a
/// store or bus. Decoding failures are delivery failures.
pub struct DecodingHandler<E, H> {
    codec: EventCodec<E>,
    inner: H,
}

impl<E, H> DecodingHandler<E, H> {
    pub fn new(codec: EventCodec<E>, inner: H) -> Self {
        Self { codec, inner }
    }
}

impl<E, H> EnvelopeHandler<RecordedEvent> for DecodingHandler<E, H>
where
    E: Send + Sync,
    H: EnvelopeHandler<EventEnvelope<E>>,
{
    fn handle(&self, message: &RecordedEvent) -> anyhow::Result<()> {
        let decoded = self.codec.decode_envelope(message)?;
        self.inner.handle(&decoded)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
