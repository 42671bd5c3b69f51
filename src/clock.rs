//! Monotonic time sources used by every limiter.
//!
//! Timestamps are nanoseconds on a monotonic timeline that starts at the
//! clock's creation. Limiters never look at wall-clock time, so tests can
//! swap in a [`ManualClock`] and step time forward deterministically.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Nanoseconds since the clock's origin.
pub type Nanos = u64;

/// A clock shared between a limiter and its background tasks.
pub type SharedClock = Arc<dyn Clock>;

/// Source of monotonic time and timers.
///
/// Implementors must be thread-safe; one clock is usually shared by many
/// limiters.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time on this clock's timeline.
    fn now(&self) -> Nanos;

    /// A future that completes once `now() >= deadline`.
    fn sleep_until(&self, deadline: Nanos) -> BoxFuture<'static, ()>;

    /// A future that completes after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleep_until(self.now().saturating_add(nanos(duration)))
    }
}

/// Convert a duration to clock nanoseconds, saturating at `u64::MAX`.
pub fn nanos(duration: Duration) -> Nanos {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Clock backed by Tokio's timer.
///
/// Under `#[tokio::test(start_paused = true)]` this clock follows Tokio's
/// paused time, so sleeps auto-advance instead of really waiting.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// A new clock behind a [`SharedClock`] handle.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Nanos {
        nanos(self.origin.elapsed())
    }

    fn sleep_until(&self, deadline: Nanos) -> BoxFuture<'static, ()> {
        match self.origin.checked_add(Duration::from_nanos(deadline)) {
            Some(deadline) => tokio::time::sleep_until(deadline).boxed(),
            None => future::pending().boxed(),
        }
    }
}

/// A virtual clock that only moves when told to.
///
/// Sleepers are woken by [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) once their deadline has passed.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Nanos,
    sleepers: Vec<(Nanos, oneshot::Sender<()>)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock starting at `start` nanoseconds.
    pub fn starting_at(start: Duration) -> Self {
        let clock = Self::new();
        clock.inner.lock().now = nanos(start);
        clock
    }

    /// This clock behind a [`SharedClock`] handle that still observes `advance`.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let target = self.now().saturating_add(nanos(by));
        self.set_nanos(target);
    }

    /// Jump to an absolute time. Time never moves backwards.
    pub fn set(&self, at: Duration) {
        self.set_nanos(nanos(at));
    }

    /// Number of sleepers still waiting for their deadline.
    pub fn pending_sleepers(&self) -> usize {
        let mut state = self.inner.lock();
        state.sleepers.retain(|(_, tx)| !tx.is_closed());
        state.sleepers.len()
    }

    fn set_nanos(&self, at: Nanos) {
        let due = {
            let mut state = self.inner.lock();
            state.now = state.now.max(at);
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .filter(|(_, tx)| !tx.is_closed())
                .partition(|(deadline, _)| *deadline <= now);
            state.sleepers = waiting;
            due
        };

        for (_, tx) in due {
            let _ = tx.send(());
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        self.inner.lock().now
    }

    fn sleep_until(&self, deadline: Nanos) -> BoxFuture<'static, ()> {
        let mut state = self.inner.lock();
        if deadline <= state.now {
            return future::ready(()).boxed();
        }

        let (tx, rx) = oneshot::channel();
        state.sleepers.push((deadline, tx));
        async move {
            let _ = rx.await;
        }
        .boxed()
    }
}
