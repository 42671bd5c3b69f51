//! Sliding window log limiter.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{nanos, Nanos, SharedClock};
use crate::config::{validate_shape, LimiterConfig, LimiterKind};
use crate::error::ConfigError;

/// Admits at most `limit` requests in any trailing window.
///
/// Every admission is logged with its timestamp, so unlike a fixed window
/// there is no burst at boundaries. The cost is memory proportional to
/// `limit` and eviction work on each check.
#[derive(Debug)]
pub struct SlidingWindowLog {
    limit: u64,
    window: Nanos,
    clock: SharedClock,
    /// Admission timestamps in insertion (and therefore time) order
    log: Mutex<VecDeque<Nanos>>,
}

impl SlidingWindowLog {
    pub fn new(limit: u64, window: Duration, clock: SharedClock) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::SlidingWindow, limit, window)?;
        Ok(Self {
            limit,
            window: nanos(window),
            clock,
            log: Mutex::new(VecDeque::with_capacity(limit.min(1024) as usize)),
        })
    }

    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, config.period(), clock)
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Admit `n` requests if the trailing window has room for all of them.
    pub fn try_acquire_n(&self, n: u64) -> bool {
        let now = self.clock.now();
        let mut log = self.log.lock();
        let evicted = self.evict(&mut log, now);

        let admitted = (log.len() as u64).saturating_add(n) <= self.limit;
        if admitted {
            log.extend(std::iter::repeat(now).take(n as usize));
        }

        trace!(
            cost = n,
            evicted,
            in_window = log.len(),
            admitted,
            "Sliding window check"
        );
        admitted
    }

    /// Admissions currently inside the trailing window.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut log = self.log.lock();
        self.evict(&mut log, now);
        log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window)
    }

    /// How long until `n` more requests fit in the window, or `None` if
    /// they never will.
    pub fn time_until_available(&self, n: u64) -> Option<Duration> {
        if n > self.limit {
            return None;
        }

        let now = self.clock.now();
        let mut log = self.log.lock();
        self.evict(&mut log, now);

        let excess = (log.len() as u64 + n).saturating_sub(self.limit);
        if excess == 0 {
            return Some(Duration::ZERO);
        }
        // The `excess`-th oldest entry has to leave the window first.
        let blocking = log[(excess - 1) as usize];
        let leaves_at = blocking.saturating_add(self.window).saturating_add(1);
        Some(Duration::from_nanos(leaves_at.saturating_sub(now)))
    }

    /// Drop entries older than `now - window`; returns how many were removed.
    fn evict(&self, log: &mut VecDeque<Nanos>, now: Nanos) -> usize {
        let cutoff = now.saturating_sub(self.window);
        let mut evicted = 0;
        while log.front().is_some_and(|&t| t < cutoff) {
            log.pop_front();
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::FixedWindowCounter;

    fn log(limit: u64, window_ms: u64) -> (SlidingWindowLog, ManualClock) {
        let clock = ManualClock::new();
        let log = SlidingWindowLog::new(limit, Duration::from_millis(window_ms), clock.shared()).unwrap();
        (log, clock)
    }

    #[test]
    fn test_admits_up_to_limit() {
        let (log, _clock) = log(5, 1000);
        for _ in 0..5 {
            assert!(log.try_acquire());
        }
        assert!(!log.try_acquire());
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_entries_expire_individually() {
        let (log, clock) = log(2, 1000);
        assert!(log.try_acquire());
        clock.advance(Duration::from_millis(400));
        assert!(log.try_acquire());
        assert!(!log.try_acquire());

        // At exactly now - window the first entry is still inside
        clock.advance(Duration::from_millis(600));
        assert!(!log.try_acquire());

        clock.advance(Duration::from_millis(1));
        assert!(log.try_acquire());
        assert!(!log.try_acquire());
    }

    #[test]
    fn test_no_burst_across_boundary() {
        let clock = ManualClock::new();
        let sliding = SlidingWindowLog::new(5, Duration::from_secs(1), clock.shared()).unwrap();
        let fixed = FixedWindowCounter::new(5, Duration::from_secs(1), clock.shared()).unwrap();

        clock.advance(Duration::from_millis(900));
        let sliding_late = (0..10).filter(|_| sliding.try_acquire()).count();
        let fixed_late = (0..10).filter(|_| fixed.try_acquire()).count();

        clock.advance(Duration::from_millis(100));
        let sliding_early = (0..10).filter(|_| sliding.try_acquire()).count();
        let fixed_early = (0..10).filter(|_| fixed.try_acquire()).count();

        assert_eq!(fixed_late + fixed_early, 10);
        assert_eq!(sliding_late + sliding_early, 5);
    }

    #[test]
    fn test_trailing_window_never_exceeds_limit() {
        let (log, clock) = log(4, 100);
        let mut admitted_at: Vec<u64> = Vec::new();

        for i in 0..400u64 {
            clock.advance(Duration::from_millis((i * 13) % 17));
            if log.try_acquire() {
                admitted_at.push(clock.now());
            }

            let now = clock.now();
            let cutoff = now.saturating_sub(100_000_000);
            let in_window = admitted_at.iter().filter(|&&t| t >= cutoff).count();
            assert!(in_window <= 4);
        }
    }

    #[test]
    fn test_time_until_available() {
        let (log, clock) = log(2, 1000);
        assert!(log.try_acquire());
        clock.advance(Duration::from_millis(300));
        assert!(log.try_acquire());

        assert_eq!(log.time_until_available(3), None);
        // The first entry (t=0) leaves once now > 1000ms
        assert_eq!(
            log.time_until_available(1),
            Some(Duration::from_nanos(700_000_001))
        );
        // Two slots need the t=300ms entry gone too
        assert_eq!(
            log.time_until_available(2),
            Some(Duration::from_nanos(1_000_000_001))
        );
    }

    #[test]
    fn test_multi_cost_admission() {
        let (log, _clock) = log(5, 1000);
        assert!(log.try_acquire_n(3));
        assert!(!log.try_acquire_n(3));
        assert!(log.try_acquire_n(2));
        assert_eq!(log.len(), 5);
    }
}
