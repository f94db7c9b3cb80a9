use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use chronicle_events::{DispatchError, EventBus, MessageDispatcher, Subscription};

const TICK: Duration = Duration::from_millis(250);

/// Handle to control and join a background worker.
///
/// Delivery failures are never swallowed: each one is logged by the worker
/// and queued here until the owner takes it with [`try_failure`] or
/// [`shutdown`].
///
/// [`try_failure`]: WorkerHandle::try_failure
/// [`shutdown`]: WorkerHandle::shutdown
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    failures: mpsc::Receiver<DispatchError>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the oldest unread delivery failure, if any.
    pub fn try_failure(&self) -> Option<DispatchError> {
        self.failures.try_recv().ok()
    }

    /// Request graceful shutdown, wait for the worker to stop, and return the
    /// delivery failures nobody has taken yet.
    ///
    /// Dropping the handle without calling this also stops the worker, but
    /// does not wait for it and loses any unread failures.
    ///
    /// Messages already queued on the subscription are dispatched before the
    /// worker exits.
    pub fn shutdown(mut self) -> Vec<DispatchError> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = %self.name, "queued dispatcher thread panicked");
            }
        }
        self.failures.try_iter().collect()
    }
}

/// Asynchronous decorator around a [`MessageDispatcher`].
///
/// The publisher only enqueues (publishes to a bus); a named worker thread
/// drains the subscription and dispatches each message. Publishing therefore
/// returns before consumers run, and a slow or failing consumer never blocks
/// or fails the append that produced the message.
///
/// Order is preserved: the worker dispatches messages one at a time in the
/// order the subscription yields them.
#[derive(Debug)]
pub struct QueuedDispatcher;

impl QueuedDispatcher {
    /// Subscribe to `bus` and spawn a worker thread running `dispatcher`.
    ///
    /// The subscription is taken before this returns, so every message
    /// published afterwards reaches the worker.
    pub fn spawn<M, B>(
        name: impl Into<String>,
        bus: &B,
        dispatcher: MessageDispatcher<M>,
    ) -> io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M> + ?Sized,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (failure_tx, failure_rx) = mpsc::channel::<DispatchError>();
        let sub: Subscription<M> = bus.subscribe();

        let worker_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&worker_name, sub, shutdown_rx, &dispatcher, failure_tx))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            failures: failure_rx,
            join: Some(join),
        })
    }
}

fn worker_loop<M>(
    name: &str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    dispatcher: &MessageDispatcher<M>,
    failures: mpsc::Sender<DispatchError>,
) {
    let deliver = |message: M| {
        if let Err(err) = dispatcher.dispatch(&message) {
            warn!(worker = name, error = %err, "queued dispatch failed");
            // The handle may already be gone; the warning above is then all
            // that is left of the failure.
            let _ = failures.send(err);
        }
    };

    loop {
        // A dropped handle counts as a shutdown request.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match sub.recv_timeout(TICK) {
            Ok(message) => deliver(message),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker = name, "bus closed, stopping");
                return;
            }
        }
    }

    // Drain what was enqueued before shutdown was requested.
    let mut drained = 0usize;
    while let Ok(message) = sub.try_recv() {
        deliver(message);
        drained += 1;
    }
    debug!(worker = name, drained, "queued dispatcher stopped");
}
