//! Fixed window counter.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{nanos, Nanos, SharedClock};
use crate::config::{validate_shape, LimiterConfig, LimiterKind};
use crate::error::ConfigError;

/// A counter that admits up to `limit` requests per aligned window.
///
/// Window boundaries are anchored at construction and roll forward in whole
/// window lengths, so a quiet period never shifts them. As with any fixed
/// window, up to `2 x limit` requests can pass around a boundary.
#[derive(Debug)]
pub struct FixedWindowCounter {
    /// The limit for this counter
    limit: u64,
    /// Window length
    window: Nanos,
    clock: SharedClock,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    /// Requests admitted in the current window
    count: u64,
    /// When the current window ends
    window_end: Nanos,
}

impl FixedWindowCounter {
    /// Create a new fixed window counter.
    pub fn new(limit: u64, window: Duration, clock: SharedClock) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::FixedWindow, limit, window)?;
        let window = nanos(window);
        let window_end = clock.now().saturating_add(window);
        Ok(Self {
            limit,
            window,
            clock,
            state: Mutex::new(WindowState {
                count: 0,
                window_end,
            }),
        })
    }

    /// Create a counter from a limiter configuration.
    pub fn from_config(config: &LimiterConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::new(config.capacity, config.period(), clock)
    }

    /// Admit one request if the window has room.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Admit `hits` requests at once if the window has room for all of them.
    pub fn try_acquire_n(&self, hits: u64) -> bool {
        let mut state = self.current();
        let admitted = state.count.saturating_add(hits) <= self.limit;
        if admitted {
            state.count += hits;
        }

        trace!(
            hits,
            count = state.count,
            limit = self.limit,
            admitted,
            "Fixed window check"
        );
        admitted
    }

    /// Check if adding hits would exceed the limit without incrementing.
    pub fn would_exceed(&self, hits: u64) -> bool {
        self.current().count.saturating_add(hits) > self.limit
    }

    /// Get the current count.
    pub fn count(&self) -> u64 {
        self.current().count
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current().count)
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window)
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self) -> Duration {
        let now = self.clock.now();
        let state = self.current_at(now);
        Duration::from_nanos(state.window_end - now)
    }

    /// How long until `hits` requests could be admitted, or `None` if they
    /// never fit in one window.
    pub fn time_until_available(&self, hits: u64) -> Option<Duration> {
        if hits > self.limit {
            return None;
        }
        if self.would_exceed(hits) {
            Some(self.duration_until_reset())
        } else {
            Some(Duration::ZERO)
        }
    }

    fn current(&self) -> parking_lot::MutexGuard<'_, WindowState> {
        self.current_at(self.clock.now())
    }

    /// Lock the state after rolling the window forward to `now`.
    fn current_at(&self, now: Nanos) -> parking_lot::MutexGuard<'_, WindowState> {
        let mut state = self.state.lock();
        if now >= state.window_end {
            let elapsed_windows = (now - state.window_end) / self.window + 1;
            state.window_end = state
                .window_end
                .saturating_add(elapsed_windows.saturating_mul(self.window));
            debug!(
                previous_count = state.count,
                skipped_windows = elapsed_windows - 1,
                "Fixed window reset"
            );
            state.count = 0;
        }
        state
    }
}
