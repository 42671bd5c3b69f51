//! Concurrency limiter.
//!
//! Bounds the number of operations in flight at once rather than their
//! rate. Waiters are served strictly in arrival order and new arrivals never
//! overtake a non-empty queue, so a waiter cannot starve while releases keep
//! happening.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::adaptive::{Outcome, OutcomeTally};
use crate::clock::SharedClock;
use crate::config::{validate_shape, LimiterConfig, LimiterKind};
use crate::error::{AcquireError, ConfigError};

/// A FIFO semaphore with timeouts, cancellation and an adjustable limit.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
    clock: SharedClock,
}

#[derive(Debug)]
struct Shared {
    /// Upper bound the limit can ever reach
    max_limit: u64,
    state: Mutex<SemaphoreState>,
}

#[derive(Debug)]
struct SemaphoreState {
    limit: u64,
    in_flight: u64,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    weight: u64,
    tx: oneshot::Sender<()>,
}

impl SemaphoreState {
    fn fits(&self, weight: u64) -> bool {
        self.in_flight.saturating_add(weight) <= self.limit
    }

    /// Hand free capacity to queued waiters, oldest first.
    fn dispatch(&mut self) {
        while self.waiters.front().is_some_and(|w| self.fits(w.weight)) {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                self.in_flight += waiter.weight;
                trace!(waiter = waiter.id, in_flight = self.in_flight, "Granted queued permit");
            }
        }
    }
}

impl Shared {
    fn release(&self, weight: u64) {
        let mut state = self.state.lock();
        assert!(
            state.in_flight >= weight,
            "released {weight} permits with only {} in flight",
            state.in_flight
        );
        state.in_flight -= weight;
        state.dispatch();
        trace!(in_flight = state.in_flight, waiting = state.waiters.len(), "Released permit");
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `limit` operations in flight.
    pub fn new(limit: u64, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::with_bounds(limit, limit, clock)
    }

    /// Create a limiter starting at `initial` that may later be raised up to `max`.
    pub(crate) fn with_bounds(initial: u64, max: u64, clock: SharedClock) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::Concurrency, initial, Duration::ZERO)?;
        Ok(Self {
            shared: Arc::new(Shared {
                max_limit: max.max(initial),
                state: Mutex::new(SemaphoreState {
                    limit: initial,
                    in_flight: 0,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
            clock,
        })
    }

    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, clock)
    }

    /// Take one slot without waiting.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.try_acquire_n(1)
    }

    /// Take `weight` slots without waiting.
    ///
    /// Fails while other callers are queued, even if capacity is free.
    pub fn try_acquire_n(&self, weight: u64) -> Option<Permit> {
        let mut state = self.shared.state.lock();
        if !state.waiters.is_empty() || !state.fits(weight) {
            trace!(weight, in_flight = state.in_flight, limit = state.limit, "Concurrency limit reached");
            return None;
        }
        state.in_flight += weight;
        Some(self.permit(weight))
    }

    /// Wait for one slot, giving up after `timeout` if one is set.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Permit, AcquireError> {
        self.acquire_or_cancel(1, timeout, future::pending()).await
    }

    /// Wait for `weight` slots, giving up after `timeout` if one is set.
    pub async fn acquire_n(&self, weight: u64, timeout: Option<Duration>) -> Result<Permit, AcquireError> {
        self.acquire_or_cancel(weight, timeout, future::pending()).await
    }

    /// Wait for `weight` slots until they are granted, `timeout` elapses, or
    /// `cancel` completes.
    ///
    /// Dropping the returned future is also a cancellation. In every case the
    /// waiter leaves the queue, and a slot granted concurrently with the
    /// cancellation is handed back.
    pub async fn acquire_or_cancel<C>(
        &self,
        weight: u64,
        timeout: Option<Duration>,
        cancel: C,
    ) -> Result<Permit, AcquireError>
    where
        C: Future<Output = ()>,
    {
        let mut pending = {
            let mut state = self.shared.state.lock();
            // A waiter heavier than the current limit would block the queue head
            if weight > state.limit {
                return Err(AcquireError::Unsatisfiable {
                    cost: weight,
                    capacity: state.limit,
                });
            }
            if state.waiters.is_empty() && state.fits(weight) {
                state.in_flight += weight;
                return Ok(self.permit(weight));
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, weight, tx });
            trace!(waiter = id, weight, waiting = state.waiters.len(), "Queued for permit");

            PendingAcquire {
                shared: &self.shared,
                id,
                weight,
                rx,
                granted: false,
            }
        };

        let deadline = match timeout {
            Some(timeout) => self.clock.sleep(timeout),
            None => future::pending().boxed(),
        };

        tokio::select! {
            biased;
            granted = &mut pending.rx => match granted {
                Ok(()) => {
                    pending.granted = true;
                    Ok(self.permit(weight))
                }
                // Only a limit lowered below the weight closes the channel.
                Err(_) => Err(AcquireError::Unsatisfiable {
                    cost: weight,
                    capacity: self.limit(),
                }),
            },
            _ = deadline => {
                debug!(waiter = pending.id, ?timeout, "Timed out waiting for permit");
                Err(AcquireError::Timeout(timeout.unwrap_or_default()))
            }
            _ = cancel => Err(AcquireError::Canceled),
        }
    }

    /// Return a permit to this limiter.
    ///
    /// # Panics
    ///
    /// Panics if the permit was issued by a different limiter.
    pub fn release(&self, permit: Permit) {
        assert!(
            Arc::ptr_eq(&self.shared, &permit.shared),
            "permit released into a limiter that did not issue it"
        );
        permit.release();
    }

    /// Current limit.
    pub fn limit(&self) -> u64 {
        self.shared.state.lock().limit
    }

    /// Highest limit this limiter can be raised to.
    pub fn max_limit(&self) -> u64 {
        self.shared.max_limit
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> u64 {
        self.shared.state.lock().in_flight
    }

    /// Callers currently queued.
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Slots free right now.
    pub fn available(&self) -> u64 {
        let state = self.shared.state.lock();
        state.limit.saturating_sub(state.in_flight)
    }

    /// Change the limit, waking waiters if it grew.
    ///
    /// Lowering the limit never revokes held permits; new admissions wait
    /// until enough of them are released. Waiters heavier than the new limit
    /// fail with [`AcquireError::Unsatisfiable`].
    pub(crate) fn set_limit(&self, limit: u64) {
        let limit = limit.clamp(1, self.shared.max_limit);
        let mut state = self.shared.state.lock();
        state.limit = limit;

        let before = state.waiters.len();
        state.waiters.retain(|w| w.weight <= limit);
        let rejected = before - state.waiters.len();
        if rejected > 0 {
            debug!(rejected, limit, "Rejected waiters heavier than the new limit");
        }
        state.dispatch();
    }

    pub(crate) fn owns(&self, permit: &Permit) -> bool {
        Arc::ptr_eq(&self.shared, &permit.shared)
    }

    fn permit(&self, weight: u64) -> Permit {
        Permit {
            shared: self.shared.clone(),
            weight,
            feedback: None,
            released: false,
        }
    }
}

/// A queued acquire. Dropping it before the grant is observed leaves the
/// queue or gives back a grant that raced with the cancellation.
struct PendingAcquire<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
    weight: u64,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }

        let shared = self.shared;
        let mut state = shared.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            // A heavy waiter leaving the head may unblock lighter ones.
            state.dispatch();
        } else if self.rx.try_recv().is_ok() {
            state.in_flight -= self.weight;
            state.dispatch();
            debug!(waiter = self.id, "Returned permit granted to a canceled waiter");
        }
    }
}

/// One held unit (or `weight` units) of concurrency.
///
/// Released exactly once: explicitly through [`release`](Permit::release),
/// [`release_with`](Permit::release_with) or the issuing limiter, or
/// implicitly when dropped.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    shared: Arc<Shared>,
    weight: u64,
    feedback: Option<Arc<OutcomeTally>>,
    released: bool,
}

impl Permit {
    /// Slots held by this permit.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Release without reporting an outcome.
    pub fn release(mut self) {
        self.finish(None);
    }

    /// Release and report how the guarded operation went.
    ///
    /// The outcome only matters for permits issued by an adaptive limiter.
    pub fn release_with(mut self, outcome: Outcome) {
        self.finish(Some(outcome));
    }

    pub(crate) fn with_feedback(mut self, tally: Arc<OutcomeTally>) -> Self {
        self.feedback = Some(tally);
        self
    }

    fn finish(&mut self, outcome: Option<Outcome>) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.shared.release(self.weight);
        if let (Some(tally), Some(outcome)) = (&self.feedback, outcome) {
            tally.record(outcome);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.finish(None);
    }
}
