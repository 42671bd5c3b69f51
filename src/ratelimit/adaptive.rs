//! Adaptive concurrency limiter.
//!
//! Wraps a [`ConcurrencyLimiter`] and moves its limit by one step per
//! adjustment period based on the success ratio reported by callers when
//! they release their permits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::concurrency::{ConcurrencyLimiter, Permit};
use crate::clock::SharedClock;
use crate::config::{validate_shape, AdaptiveSettings, LimiterConfig, LimiterKind};
use crate::error::{AcquireError, ConfigError};
use crate::task::PeriodicTask;

/// How an operation guarded by a permit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Outcomes recorded since the last adjustment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    /// Fraction of successes, undefined (`None`) when nothing was recorded.
    pub fn success_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.success as f64 / total as f64),
        }
    }
}

/// Shared sink for outcomes reported through permits.
#[derive(Debug, Default)]
pub(crate) struct OutcomeTally {
    counts: Mutex<OutcomeCounts>,
}

impl OutcomeTally {
    pub(crate) fn record(&self, outcome: Outcome) {
        let mut counts = self.counts.lock();
        match outcome {
            Outcome::Success => counts.success += 1,
            Outcome::Failure => counts.failure += 1,
        }
    }

    fn peek(&self) -> OutcomeCounts {
        *self.counts.lock()
    }

    /// Read and reset the counters in one step.
    fn take(&self) -> OutcomeCounts {
        std::mem::take(&mut *self.counts.lock())
    }
}

/// What a single adjustment step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increased { from: u64, to: u64 },
    Decreased { from: u64, to: u64 },
    /// The ratio was between the thresholds, or the limit was already at a bound
    Held { limit: u64 },
    /// No outcomes were recorded during the period
    Skipped,
}

/// A concurrency limiter whose bound follows observed success rates.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    core: Arc<Core>,
    adjust_interval: Duration,
    _adjuster: Option<PeriodicTask>,
}

#[derive(Debug)]
struct Core {
    inner: ConcurrencyLimiter,
    tally: Arc<OutcomeTally>,
    min_limit: u64,
    max_limit: u64,
    increase_above: f64,
    decrease_below: f64,
}

impl Core {
    fn adjust(&self) -> Adjustment {
        let counts = self.tally.take();
        let Some(rate) = counts.success_rate() else {
            return Adjustment::Skipped;
        };

        let limit = self.inner.limit();
        let adjustment = if rate > self.increase_above && limit < self.max_limit {
            Adjustment::Increased {
                from: limit,
                to: limit + 1,
            }
        } else if rate < self.decrease_below && limit > self.min_limit {
            Adjustment::Decreased {
                from: limit,
                to: limit - 1,
            }
        } else {
            Adjustment::Held { limit }
        };

        match adjustment {
            Adjustment::Increased { to, .. } | Adjustment::Decreased { to, .. } => {
                self.inner.set_limit(to);
                debug!(
                    success = counts.success,
                    failure = counts.failure,
                    rate,
                    ?adjustment,
                    "Adjusted concurrency limit"
                );
            }
            _ => {}
        }
        adjustment
    }
}

impl AdaptiveLimiter {
    /// Create a limiter whose adjustment runs every `adjust_interval` as a
    /// background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(
        max_limit: u64,
        adjust_interval: Duration,
        settings: AdaptiveSettings,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let mut limiter = Self::new_manual(max_limit, adjust_interval, settings, clock.clone())?;
        limiter._adjuster = Some(PeriodicTask::spawn(
            "adaptive_adjust",
            clock,
            adjust_interval,
            Arc::downgrade(&limiter.core),
            |core: &Core| {
                core.adjust();
            },
        ));
        Ok(limiter)
    }

    /// Create a limiter that only adjusts when [`adjust`](Self::adjust) is called.
    pub fn new_manual(
        max_limit: u64,
        adjust_interval: Duration,
        settings: AdaptiveSettings,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::Adaptive, max_limit, adjust_interval)?;
        settings.validate(max_limit)?;

        let inner = ConcurrencyLimiter::with_bounds(settings.initial_limit(), max_limit, clock)?;
        Ok(Self {
            core: Arc::new(Core {
                inner,
                tally: Arc::new(OutcomeTally::default()),
                min_limit: settings.min_limit,
                max_limit,
                increase_above: settings.increase_above,
                decrease_below: settings.decrease_below,
            }),
            adjust_interval,
            _adjuster: None,
        })
    }

    /// Create a self-adjusting limiter from a limiter configuration.
    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, config.period(), config.adaptive_settings(), clock)
    }

    /// Take one slot without waiting.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.try_acquire_n(1)
    }

    pub fn try_acquire_n(&self, weight: u64) -> Option<Permit> {
        self.core
            .inner
            .try_acquire_n(weight)
            .map(|permit| permit.with_feedback(self.core.tally.clone()))
    }

    /// Wait for one slot, giving up after `timeout` if one is set.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Permit, AcquireError> {
        self.acquire_or_cancel(1, timeout, future::pending()).await
    }

    /// Wait for `weight` slots until granted, timed out or canceled.
    pub async fn acquire_or_cancel<C>(
        &self,
        weight: u64,
        timeout: Option<Duration>,
        cancel: C,
    ) -> Result<Permit, AcquireError>
    where
        C: Future<Output = ()>,
    {
        let permit = self.core.inner.acquire_or_cancel(weight, timeout, cancel).await?;
        Ok(permit.with_feedback(self.core.tally.clone()))
    }

    /// Release a permit and record how its operation went.
    ///
    /// # Panics
    ///
    /// Panics if the permit was issued by a different limiter.
    pub fn release(&self, permit: Permit, outcome: Outcome) {
        assert!(
            self.core.inner.owns(&permit),
            "permit released into a limiter that did not issue it"
        );
        permit.release_with(outcome);
    }

    /// Run one adjustment step now.
    pub fn adjust(&self) -> Adjustment {
        self.core.adjust()
    }

    pub fn limit(&self) -> u64 {
        self.core.inner.limit()
    }

    pub fn min_limit(&self) -> u64 {
        self.core.min_limit
    }

    pub fn max_limit(&self) -> u64 {
        self.core.max_limit
    }

    pub fn in_flight(&self) -> u64 {
        self.core.inner.in_flight()
    }

    /// Callers currently queued.
    pub fn waiting(&self) -> usize {
        self.core.inner.waiting()
    }

    pub fn adjust_interval(&self) -> Duration {
        self.adjust_interval
    }

    /// Outcomes recorded since the last adjustment.
    pub fn pending_outcomes(&self) -> OutcomeCounts {
        self.core.tally.peek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};

    fn limiter(min: u64, max: u64) -> AdaptiveLimiter {
        let clock = ManualClock::new();
        AdaptiveLimiter::new_manual(
            max,
            Duration::from_secs(2),
            AdaptiveSettings::new(min),
            clock.shared(),
        )
        .unwrap()
    }

    fn report(limiter: &AdaptiveLimiter, successes: u64, failures: u64) {
        for i in 0..successes + failures {
            let permit = limiter.try_acquire().unwrap();
            let outcome = if i < successes {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            limiter.release(permit, outcome);
        }
    }

    #[test]
    fn test_starts_at_min_limit() {
        let limiter = limiter(2, 10);
        assert_eq!(limiter.limit(), 2);
        let _a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
    }

    #[test]
    fn test_success_stream_converges_to_max() {
        let limiter = limiter(2, 6);
        let mut previous = limiter.limit();

        for _ in 0..10 {
            report(&limiter, 10, 0);
            limiter.adjust();
            let current = limiter.limit();
            assert!(current >= previous);
            assert!(current - previous <= 1);
            previous = current;
        }

        assert_eq!(limiter.limit(), 6);
        report(&limiter, 10, 0);
        assert_eq!(limiter.adjust(), Adjustment::Held { limit: 6 });
    }

    #[test]
    fn test_failure_stream_converges_to_min() {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::new_manual(
            8,
            Duration::from_secs(1),
            AdaptiveSettings::new(2).initial(8),
            clock.shared(),
        )
        .unwrap();

        let mut previous = limiter.limit();
        for _ in 0..10 {
            report(&limiter, 0, 5);
            limiter.adjust();
            assert!(limiter.limit() <= previous);
            previous = limiter.limit();
        }
        assert_eq!(limiter.limit(), 2);
    }

    #[test]
    fn test_middling_ratio_holds() {
        let limiter = limiter(1, 10);
        // 80% success sits between the thresholds
        report(&limiter, 8, 2);
        assert_eq!(limiter.adjust(), Adjustment::Held { limit: 1 });
    }

    #[test]
    fn test_no_outcomes_skips() {
        let limiter = limiter(3, 10);
        assert_eq!(limiter.adjust(), Adjustment::Skipped);
        assert_eq!(limiter.limit(), 3);

        // Releasing without an outcome records nothing
        limiter.try_acquire().unwrap().release();
        assert_eq!(limiter.adjust(), Adjustment::Skipped);
    }

    #[test]
    fn test_counters_reset_after_every_step() {
        let limiter = limiter(1, 10);
        report(&limiter, 8, 2);
        assert_eq!(limiter.pending_outcomes().total(), 10);

        limiter.adjust();
        assert_eq!(limiter.pending_outcomes(), OutcomeCounts::default());

        // The earlier failures do not dilute the next period
        report(&limiter, 10, 0);
        assert_eq!(limiter.adjust(), Adjustment::Increased { from: 1, to: 2 });
    }

    #[test]
    fn test_outcome_through_permit() {
        let limiter = limiter(1, 4);
        let permit = limiter.try_acquire().unwrap();
        permit.release_with(Outcome::Failure);
        assert_eq!(
            limiter.pending_outcomes(),
            OutcomeCounts {
                success: 0,
                failure: 1
            }
        );
    }

    #[test]
    fn test_invalid_settings() {
        let clock = ManualClock::new();
        let err = AdaptiveLimiter::new_manual(
            4,
            Duration::from_secs(1),
            AdaptiveSettings::new(0),
            clock.shared(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBounds { .. }));

        let err = AdaptiveLimiter::new_manual(
            4,
            Duration::ZERO,
            AdaptiveSettings::new(1),
            clock.shared(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::ZeroPeriod(LimiterKind::Adaptive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_adjustment_is_timer_driven() {
        let limiter = AdaptiveLimiter::new(
            5,
            Duration::from_secs(2),
            AdaptiveSettings::new(1),
            TokioClock::shared(),
        )
        .unwrap();

        for _ in 0..3 {
            report(&limiter, 10, 0);
            tokio::time::sleep(Duration::from_millis(2001)).await;
        }
        assert_eq!(limiter.limit(), 4);

        // Quiet periods leave the limit alone
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(limiter.limit(), 4);
    }
}
