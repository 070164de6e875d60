//! One-shot wait/signal synchronization point.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Returned when a wait elapsed before anyone arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Rendezvous timed out after {0:?}")]
pub struct RendezvousTimeout(pub Duration);

#[derive(Debug, Default)]
struct State {
    arrived: Mutex<bool>,
    cond: Condvar,
}

/// A waiting thread blocks until a releasing thread arrives or a timeout
/// elapses.
///
/// One waiter, one arrival. Arriving after the waiter gave up is harmless.
#[derive(Debug, Clone, Default)]
pub struct Rendezvous {
    state: Arc<State>,
}

impl Rendezvous {
    /// Create a pending rendezvous.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the waiter.
    pub fn arrive(&self) {
        let mut arrived = self.state.arrived.lock();
        *arrived = true;
        self.state.cond.notify_all();
    }

    /// Whether `arrive` has been called.
    #[must_use]
    pub fn has_arrived(&self) -> bool {
        *self.state.arrived.lock()
    }

    /// Block until released or until `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`RendezvousTimeout`] if nobody arrived in time.
    pub fn wait(&self, timeout: Duration) -> Result<(), RendezvousTimeout> {
        let mut arrived = self.state.arrived.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*arrived {
                self.state.cond.wait(&mut arrived);
            }
            return Ok(());
        };

        while !*arrived {
            if self.state.cond.wait_until(&mut arrived, deadline).timed_out() {
                return if *arrived {
                    Ok(())
                } else {
                    Err(RendezvousTimeout(timeout))
                };
            }
        }
        Ok(())
    }
}
