//! Projection runner utilities (read model builders).
//!
//! Tracks how far a projection has read in the global order and refuses to
//! apply anything out of order. Out-of-order input is an error, never a
//! silent skip, since a skipped envelope is lost to the read model.

use std::sync::Mutex;

use thiserror::Error;
use tracing::trace;

use crate::handler::EnvelopeHandler;
use crate::{EventEnvelope, Projection};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("envelope at global position {found} is not after {last}")]
    NonMonotonicPosition { last: u64, found: u64 },
}

/// Runs envelopes through a projection and tracks progress.
#[derive(Debug)]
pub struct ProjectionRunner<P> {
    projection: P,
    last_position: Option<u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            last_position: None,
        }
    }

    /// Resume a projection whose read model already reflects everything up to
    /// `position`.
    pub fn resume_from(projection: P, position: u64) -> Self {
        Self {
            projection,
            last_position: Some(position),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Global position of the last envelope applied, if any.
    pub fn last_position(&self) -> Option<u64> {
        self.last_position
    }

    /// Whether `envelope` is the one applied last (a redelivery).
    ///
    /// Only the exact last position counts: a lower position may never have
    /// been applied, so it is not a duplicate but an ordering error.
    pub fn is_redelivery<E>(&self, envelope: &EventEnvelope<E>) -> bool {
        self.last_position == Some(envelope.global_position())
    }

    /// Apply a single envelope, enforcing strictly increasing global positions.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError> {
        let found = envelope.global_position();
        if let Some(last) = self.last_position {
            if found <= last {
                return Err(ProjectionError::NonMonotonicPosition { last, found });
            }
        }

        self.projection.apply(envelope);
        self.last_position = Some(found);
        Ok(())
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying the full history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<Self, ProjectionError>
    where
        P::Ev: 'a,
    {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok(runner)
    }
}

/// A projection runner that can be registered with a dispatcher.
///
/// A redelivery of the last applied envelope is skipped. Anything older than
/// that fails with `NonMonotonicPosition`, so an envelope dispatched out of
/// global order surfaces as a delivery failure instead of vanishing.
#[derive(Debug)]
pub struct SharedProjection<P> {
    name: String,
    runner: Mutex<ProjectionRunner<P>>,
}

impl<P: Projection> SharedProjection<P> {
    pub fn new(name: impl Into<String>, runner: ProjectionRunner<P>) -> Self {
        Self {
            name: name.into(),
            runner: Mutex::new(runner),
        }
    }

    /// Run `f` against the current read model.
    pub fn read<R>(&self, f: impl FnOnce(&P) -> R) -> anyhow::Result<R> {
        let runner = self
            .runner
            .lock()
            .map_err(|_| anyhow::anyhow!("projection `{}` lock poisoned", self.name))?;
        Ok(f(runner.projection()))
    }

    pub fn last_position(&self) -> Option<u64> {
        self.runner.lock().ok().and_then(|r| r.last_position())
    }
}

impl<P> EnvelopeHandler<EventEnvelope<P::Ev>> for SharedProjection<P>
where
    P: Projection + Send,
{
    fn handle(&self, message: &EventEnvelope<P::Ev>) -> anyhow::Result<()> {
        let mut runner = self
            .runner
            .lock()
            .map_err(|_| anyhow::anyhow!("projection `{}` lock poisoned", self.name))?;

        if runner.is_redelivery(message) {
            trace!(
                projection = %self.name,
                position = message.global_position(),
                "skipping redelivered envelope"
            );
            return Ok(());
        }
        runner.apply(message)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
