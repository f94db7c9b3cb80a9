//! Publish/subscribe transport for committed envelopes.
//!
//! The bus is how envelopes reach consumers that run **outside** the
//! appending call: a queued dispatcher on a worker thread, another process,
//! a broker. It carries no storage guarantees; the event log is the source of
//! truth and anything missed can be re-read with `read_all`.
//!
//! Delivery is at-least-once from the consumer's point of view (a consumer
//! that re-reads after a restart will see envelopes again), so consumers
//! should be idempotent, e.g. by tracking the last global position applied.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus.
///
/// Every subscription receives its own copy of each message published after
/// it was created, in publication order. A subscription is meant to be drained
/// by one thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Broadcast bus abstraction.
///
/// `publish` may fail (closed, full, unreachable); the caller decides whether
/// to retry. Since envelopes are already committed when published, retrying
/// is always safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
