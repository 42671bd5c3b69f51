//! Cancelable periodic background work owned by a limiter.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::clock::{nanos, SharedClock};

/// A periodic task tied to the lifetime of the state it works on.
///
/// The task only holds a weak reference to its state and stops on its own
/// once the state is gone. Dropping the handle aborts it immediately, so no
/// timer outlives the limiter that started it.
#[derive(Debug)]
pub(crate) struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `step` every `period` on the current Tokio runtime.
    ///
    /// Ticks are aligned to the spawn instant. Ticks missed while the step
    /// was not scheduled are skipped rather than replayed in a burst.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub(crate) fn spawn<S, F>(
        name: &'static str,
        clock: SharedClock,
        period: Duration,
        state: Weak<S>,
        mut step: F,
    ) -> Self
    where
        S: Send + Sync + 'static,
        F: FnMut(&S) + Send + 'static,
    {
        let period = nanos(period).max(1);
        let handle = tokio::spawn(async move {
            let mut next = clock.now().saturating_add(period);
            loop {
                clock.sleep_until(next).await;

                let Some(state) = state.upgrade() else {
                    trace!(task = name, "Owner dropped, stopping background task");
                    break;
                };
                // A fault in one step stays inside this limiter.
                if panic::catch_unwind(AssertUnwindSafe(|| step(&state))).is_err() {
                    error!(task = name, "Background step panicked");
                }
                drop(state);

                let now = clock.now();
                next = next.saturating_add(period);
                if next <= now {
                    next = now.saturating_add(period - (now - next) % period);
                }
            }
        });

        Self { name, handle }
    }

    /// Whether the task has stopped.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        trace!(task = self.name, "Aborting background task");
        self.handle.abort();
    }
}
