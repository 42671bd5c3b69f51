//! Token bucket limiter.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{nanos, Nanos, SharedClock};
use crate::config::{validate_shape, LimiterConfig, LimiterKind};
use crate::error::ConfigError;

/// A capacity-bounded bucket refilled with one token per period.
///
/// Refill is computed lazily on every check, so no background task is
/// needed. Whole periods are credited and the remainder is carried, which
/// makes the observable behaviour match a continuously refilling bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_period: Nanos,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens currently available, always within `[0, capacity]`
    level: u64,
    /// Instant up to which refill progress has been credited
    last_refill: Nanos,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u64, refill_period: Duration, clock: SharedClock) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::TokenBucket, capacity, refill_period)?;
        let now = clock.now();
        Ok(Self {
            capacity,
            refill_period: nanos(refill_period),
            clock,
            state: Mutex::new(BucketState {
                level: capacity,
                last_refill: now,
            }),
        })
    }

    /// Create a bucket from a limiter configuration.
    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, config.period(), clock)
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Take `n` tokens if all of them are available.
    ///
    /// A rejected call leaves the bucket untouched.
    pub fn try_acquire_n(&self, n: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        let admitted = state.level >= n;
        if admitted {
            state.level -= n;
        }

        trace!(
            cost = n,
            level = state.level,
            admitted,
            "Token bucket check"
        );
        admitted
    }

    /// Tokens available right now.
    pub fn available(&self) -> u64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.level
    }

    /// How long until `n` tokens are available, or `None` if `n` exceeds
    /// the capacity and never will be.
    pub fn time_until_available(&self, n: u64) -> Option<Duration> {
        if n > self.capacity {
            return None;
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.level >= n {
            return Some(Duration::ZERO);
        }
        let deficit = n - state.level;
        let progress = now - state.last_refill;
        let wait = deficit
            .saturating_mul(self.refill_period)
            .saturating_sub(progress);
        Some(Duration::from_nanos(wait))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn refill_period(&self) -> Duration {
        Duration::from_nanos(self.refill_period)
    }

    fn refill(&self, state: &mut BucketState, now: Nanos) {
        // A full bucket does not bank progress towards future tokens.
        if state.level >= self.capacity {
            state.last_refill = now;
            return;
        }

        let elapsed = now.saturating_sub(state.last_refill);
        let tokens = elapsed / self.refill_period;
        if tokens == 0 {
            return;
        }

        let level = state.level.saturating_add(tokens);
        if level >= self.capacity {
            state.level = self.capacity;
            state.last_refill = now;
        } else {
            state.level = level;
            state.last_refill += tokens * self.refill_period;
        }
    }
}
