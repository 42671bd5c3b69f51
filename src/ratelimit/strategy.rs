//! Uniform limiter interface over every admission strategy.
//!
//! Callers that only care about "may this proceed" hold an
//! `Arc<dyn Limiter>` built by [`build_limiter`] and can switch strategies
//! through configuration alone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use tracing::debug;

use super::adaptive::{AdaptiveLimiter, Outcome};
use super::concurrency::{ConcurrencyLimiter, Permit};
use super::fixed_window::FixedWindowCounter;
use super::leaky_bucket::{LeakyBucket, Ticket};
use super::sliding_window::SlidingWindowLog;
use super::token_bucket::TokenBucket;
use crate::clock::{nanos, SharedClock};
use crate::config::{LimiterConfig, LimiterKind};
use crate::error::{AcquireError, ConfigError};

/// Trait for admission strategies.
///
/// This trait abstracts over every limiter so a caller can work with any
/// of them. Strategies that need a release (concurrency, adaptive) hand out
/// permits; queueing strategies (leaky bucket) hand out tickets from
/// `try_admit` and wait for the turn inside `admit`.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Which strategy this is.
    fn kind(&self) -> LimiterKind;

    /// Capacity the limiter was configured with.
    fn capacity(&self) -> u64;

    /// Admit `cost` units now or return `None`. Never waits.
    fn try_admit(&self, cost: u64) -> Option<Admission>;

    /// Admit `cost` units, waiting up to `timeout` (forever when `None`).
    ///
    /// A successful result is ready to proceed: it is never
    /// [`Admission::Queued`].
    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError>;

    /// Whether dropping this limiter now loses nothing but its counters.
    ///
    /// False while permits are held, items are queued or callers wait.
    fn is_idle(&self) -> bool {
        true
    }
}

/// A positive admission decision.
#[derive(Debug)]
#[must_use = "an admission may hold capacity until it is released"]
pub enum Admission {
    /// Proceed; nothing to give back.
    Granted,
    /// Proceed while holding concurrency; release when done.
    Permit(Permit),
    /// Accepted into a queue; wait with [`ready`](Admission::ready) before
    /// proceeding.
    Queued(Ticket),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }

    /// Wait for a queued admission's turn. Other admissions are returned
    /// as they are.
    pub async fn ready(self, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        match self {
            Admission::Queued(ticket) => {
                ticket.wait(timeout).await?;
                Ok(Admission::Granted)
            }
            ready => Ok(ready),
        }
    }

    /// Finish the admitted work and report how it went.
    ///
    /// Only permits from an adaptive limiter use the outcome; a still
    /// queued admission gives its slot back.
    pub fn release(self, outcome: Outcome) {
        match self {
            Admission::Permit(permit) => permit.release_with(outcome),
            Admission::Queued(ticket) => drop(ticket),
            Admission::Granted => {}
        }
    }
}

/// Build the limiter described by `config`.
///
/// # Panics
///
/// Leaky bucket and adaptive limiters start a background task, so building
/// them panics outside of a Tokio runtime.
pub fn build_limiter(config: &LimiterConfig, clock: SharedClock) -> Result<Arc<dyn Limiter>, ConfigError> {
    config.validate()?;
    let limiter: Arc<dyn Limiter> = match config.kind {
        LimiterKind::TokenBucket => Arc::new(TokenBucket::from_config(config, clock)?),
        LimiterKind::LeakyBucket => Arc::new(LeakyBucket::from_config(config, clock)?),
        LimiterKind::FixedWindow => Arc::new(FixedWindowCounter::from_config(config, clock)?),
        LimiterKind::SlidingWindow => Arc::new(SlidingWindowLog::from_config(config, clock)?),
        LimiterKind::Concurrency => Arc::new(ConcurrencyLimiter::from_config(config, clock)?),
        LimiterKind::Adaptive => Arc::new(AdaptiveLimiter::from_config(config, clock)?),
    };
    debug!(
        kind = %config.kind,
        capacity = config.capacity,
        period_ms = config.period_ms,
        "Built limiter"
    );
    Ok(limiter)
}

/// What a counter-style limiter can say about a request right now.
enum Availability {
    Admitted,
    After(Duration),
    Never,
}

/// Retry a counter-style limiter until it admits or the deadline passes.
///
/// Fails fast with a timeout once the next chance to be admitted lies past
/// the deadline.
async fn admit_when_available<F>(
    clock: &SharedClock,
    cost: u64,
    capacity: u64,
    timeout: Option<Duration>,
    mut poll: F,
) -> Result<Admission, AcquireError>
where
    F: FnMut() -> Availability + Send,
{
    let deadline = timeout.map(|t| clock.now().saturating_add(nanos(t)));
    loop {
        let wait = match poll() {
            Availability::Admitted => return Ok(Admission::Granted),
            Availability::Never => return Err(AcquireError::Unsatisfiable { cost, capacity }),
            Availability::After(wait) => nanos(wait).max(1),
        };

        let wake_at = clock.now().saturating_add(wait);
        if deadline.is_some_and(|deadline| wake_at > deadline) {
            return Err(AcquireError::Timeout(timeout.unwrap_or_default()));
        }
        clock.sleep_until(wake_at).await;
    }
}

fn availability(admitted: bool, wait: impl FnOnce() -> Option<Duration>) -> Availability {
    if admitted {
        return Availability::Admitted;
    }
    match wait() {
        Some(wait) => Availability::After(wait),
        None => Availability::Never,
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn kind(&self) -> LimiterKind {
        LimiterKind::TokenBucket
    }

    fn capacity(&self) -> u64 {
        TokenBucket::capacity(self)
    }

    fn try_admit(&self, cost: u64) -> Option<Admission> {
        self.try_acquire_n(cost).then_some(Admission::Granted)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        admit_when_available(self.clock(), cost, TokenBucket::capacity(self), timeout, || {
            availability(self.try_acquire_n(cost), || self.time_until_available(cost))
        })
        .await
    }
}

#[async_trait]
impl Limiter for FixedWindowCounter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::FixedWindow
    }

    fn capacity(&self) -> u64 {
        self.limit()
    }

    fn try_admit(&self, cost: u64) -> Option<Admission> {
        self.try_acquire_n(cost).then_some(Admission::Granted)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        admit_when_available(self.clock(), cost, self.limit(), timeout, || {
            availability(self.try_acquire_n(cost), || self.time_until_available(cost))
        })
        .await
    }
}

#[async_trait]
impl Limiter for SlidingWindowLog {
    fn kind(&self) -> LimiterKind {
        LimiterKind::SlidingWindow
    }

    fn capacity(&self) -> u64 {
        self.limit()
    }

    fn try_admit(&self, cost: u64) -> Option<Admission> {
        self.try_acquire_n(cost).then_some(Admission::Granted)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        admit_when_available(self.clock(), cost, self.limit(), timeout, || {
            availability(self.try_acquire_n(cost), || self.time_until_available(cost))
        })
        .await
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    fn kind(&self) -> LimiterKind {
        LimiterKind::LeakyBucket
    }

    fn capacity(&self) -> u64 {
        LeakyBucket::capacity(self)
    }

    /// Only single items can queue; any other cost is never admitted.
    fn try_admit(&self, cost: u64) -> Option<Admission> {
        if cost != 1 {
            return None;
        }
        self.try_enqueue().map(Admission::Queued)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        if cost != 1 {
            return Err(AcquireError::Unsatisfiable { cost, capacity: 1 });
        }
        let ticket = self
            .try_enqueue()
            .ok_or(AcquireError::Rejected("leaky bucket queue is full"))?;
        ticket.wait(timeout).await?;
        Ok(Admission::Granted)
    }

    fn is_idle(&self) -> bool {
        self.is_empty()
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Concurrency
    }

    fn capacity(&self) -> u64 {
        self.max_limit()
    }

    fn try_admit(&self, cost: u64) -> Option<Admission> {
        self.try_acquire_n(cost).map(Admission::Permit)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        self.acquire_n(cost, timeout).await.map(Admission::Permit)
    }

    fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.waiting() == 0
    }
}

#[async_trait]
impl Limiter for AdaptiveLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Adaptive
    }

    fn capacity(&self) -> u64 {
        self.max_limit()
    }

    fn try_admit(&self, cost: u64) -> Option<Admission> {
        self.try_acquire_n(cost).map(Admission::Permit)
    }

    async fn admit(&self, cost: u64, timeout: Option<Duration>) -> Result<Admission, AcquireError> {
        self.acquire_or_cancel(cost, timeout, future::pending::<()>())
            .await
            .map(Admission::Permit)
    }

    fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.waiting() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_pending, assert_ready, task};

    fn config(kind: LimiterKind, capacity: u64, period_ms: u64) -> LimiterConfig {
        LimiterConfig::new(kind, capacity, Duration::from_millis(period_ms))
    }

    #[tokio::test]
    async fn test_build_every_kind() {
        let clock = ManualClock::new();
        for kind in [
            LimiterKind::TokenBucket,
            LimiterKind::LeakyBucket,
            LimiterKind::FixedWindow,
            LimiterKind::SlidingWindow,
            LimiterKind::Concurrency,
            LimiterKind::Adaptive,
        ] {
            let limiter = build_limiter(&config(kind, 4, 100), clock.shared()).unwrap();
            assert_eq!(limiter.kind(), kind);
            assert_eq!(limiter.capacity(), 4);
        }
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let clock = ManualClock::new();
        let err = build_limiter(&config(LimiterKind::SlidingWindow, 0, 100), clock.shared())
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroCapacity);
    }

    #[test]
    fn test_counter_admit_waits_for_refill() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(1, Duration::from_millis(200), clock.shared()).unwrap();
        assert!(bucket.try_acquire());

        let mut admit = task::spawn(bucket.admit(1, None));
        assert_pending!(admit.poll());

        clock.advance(Duration::from_millis(200));
        let admission = assert_ready!(admit.poll()).unwrap();
        assert!(matches!(admission, Admission::Granted));
    }

    #[test]
    fn test_counter_admit_times_out_when_refill_is_too_late() {
        let clock = ManualClock::new();
        let window = FixedWindowCounter::new(1, Duration::from_secs(1), clock.shared()).unwrap();
        assert!(window.try_acquire());

        let mut admit = task::spawn(window.admit(1, Some(Duration::from_millis(100))));
        assert_eq!(
            assert_ready!(admit.poll()).unwrap_err(),
            AcquireError::Timeout(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_oversized_cost_is_unsatisfiable() {
        let clock = ManualClock::new();
        let log = SlidingWindowLog::new(2, Duration::from_secs(1), clock.shared()).unwrap();
        let mut admit = task::spawn(log.admit(3, None));
        assert_eq!(
            assert_ready!(admit.poll()).unwrap_err(),
            AcquireError::Unsatisfiable { cost: 3, capacity: 2 }
        );
    }

    #[test]
    fn test_queued_admission_is_ready_after_drain() {
        let clock = ManualClock::new();
        let bucket = LeakyBucket::new_manual(2, Duration::from_millis(100), clock.shared()).unwrap();

        let admission = bucket.try_admit(1).unwrap();
        assert!(admission.is_queued());
        assert!(bucket.try_admit(2).is_none());

        let mut ready = task::spawn(admission.ready(None));
        assert_pending!(ready.poll());
        bucket.drain_once();
        assert!(matches!(assert_ready!(ready.poll()).unwrap(), Admission::Granted));
    }

    #[test]
    fn test_releasing_queued_admission_frees_slot() {
        let clock = ManualClock::new();
        let bucket = LeakyBucket::new_manual(1, Duration::from_millis(100), clock.shared()).unwrap();

        let admission = bucket.try_admit(1).unwrap();
        assert!(bucket.try_admit(1).is_none());
        admission.release(Outcome::Success);
        assert!(bucket.try_admit(1).is_some());
    }

    #[test]
    fn test_idle_only_without_held_state() {
        let clock = ManualClock::new();
        let limiter = ConcurrencyLimiter::new(1, clock.shared()).unwrap();
        let bucket = LeakyBucket::new_manual(1, Duration::from_millis(100), clock.shared()).unwrap();
        let window = FixedWindowCounter::new(1, Duration::from_secs(1), clock.shared()).unwrap();

        let permit = limiter.try_admit(1).unwrap();
        let ticket = bucket.try_admit(1).unwrap();
        assert!(window.try_admit(1).is_some());
        assert!(!Limiter::is_idle(&limiter));
        assert!(!Limiter::is_idle(&bucket));
        assert!(Limiter::is_idle(&window));

        permit.release(Outcome::Success);
        ticket.release(Outcome::Success);
        assert!(Limiter::is_idle(&limiter));
        assert!(Limiter::is_idle(&bucket));
    }

    #[test]
    fn test_permit_admission_release() {
        let clock = ManualClock::new();
        let limiter = ConcurrencyLimiter::new(1, clock.shared()).unwrap();

        let admission = limiter.try_admit(1).unwrap();
        assert!(limiter.try_admit(1).is_none());
        admission.release(Outcome::Success);
        assert_eq!(limiter.in_flight(), 0);
    }
}
