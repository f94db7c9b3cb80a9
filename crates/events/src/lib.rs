//! `chronicle-events` — events, envelopes, codec and consumer dispatch.
//!
//! Nothing in this crate touches storage. It defines what gets stored (the
//! [`EventEnvelope`]), how domain events map to and from it (the
//! [`EventCodec`]), and how committed envelopes reach consumers (the
//! [`MessageDispatcher`] with per-consumer [`MessageFilter`]s).

pub mod bus;
pub mod codec;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod filter;
pub mod handler;
pub mod in_memory_bus;
pub mod payload;
pub mod projection;
pub mod runner;

pub use bus::{EventBus, Subscription};
pub use codec::{CodecError, EventCodec};
pub use dispatcher::{
    ConsumerDeliveryFailure, DispatchError, DispatchReport, FailurePolicy, MessageDispatcher,
};
pub use envelope::{EventEnvelope, RecordedEvent};
pub use event::{DecodeEvent, Event};
pub use filter::{AlwaysAllowingMessageFilter, Filter, MessageFilter, NeverAllowingMessageFilter};
pub use handler::{DecodingHandler, EnvelopeHandler, FnHandler, handler_fn};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use payload::Payload;
pub use projection::Projection;
pub use runner::{ProjectionError, ProjectionRunner, SharedProjection};
