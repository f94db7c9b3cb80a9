//! Background workers.

pub mod queued_dispatcher;

pub use queued_dispatcher::{QueuedDispatcher, WorkerHandle};
