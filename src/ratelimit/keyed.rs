//! Per-key limiter registry.
//!
//! A [`KeyedLimiter`] multiplexes one logical limit over many keys: every
//! key lazily gets its own limiter from a shared factory, so exhausting one
//! key never affects another. Keys that stay idle are swept away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::strategy::{build_limiter, Limiter};
use crate::clock::{nanos, Nanos, SharedClock};
use crate::config::{KeyedConfig, LimiterConfig};
use crate::error::ConfigError;
use crate::task::PeriodicTask;

type Factory<L> = Box<dyn Fn(&str) -> Result<Arc<L>, ConfigError> + Send + Sync>;

/// Lazily created, independently limited state per key.
pub struct KeyedLimiter<L: ?Sized + Limiter + 'static> {
    registry: Arc<Registry<L>>,
    _sweeper: Option<PeriodicTask>,
}

struct Registry<L: ?Sized> {
    entries: DashMap<String, Entry<L>>,
    factory: Factory<L>,
    idle_timeout: Nanos,
    clock: SharedClock,
}

struct Entry<L: ?Sized> {
    limiter: Arc<L>,
    last_access: AtomicU64,
}

impl<L: ?Sized + Limiter> Registry<L> {
    /// Remove entries idle for at least the timeout that nobody holds.
    ///
    /// Runs under the map's shard locks, so a key is never removed while
    /// `for_key` hands it out.
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) >= self.idle_timeout;
            // Permits and tickets outlive the limiter handle they came from
            let in_use = Arc::strong_count(&entry.limiter) > 1 || !entry.limiter.is_idle();
            if idle && !in_use {
                trace!(key = %key, "Evicting idle key");
                return false;
            }
            true
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept idle keys");
        }
        removed
    }
}

impl<L: ?Sized + Limiter + 'static> KeyedLimiter<L> {
    /// Create a registry whose idle keys are swept every `sweep_interval` by
    /// a background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new<F>(
        factory: F,
        idle_timeout: Duration,
        sweep_interval: Duration,
        clock: SharedClock,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<Arc<L>, ConfigError> + Send + Sync + 'static,
    {
        if sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweep);
        }
        let mut keyed = Self::new_manual(factory, idle_timeout, clock.clone())?;
        keyed._sweeper = Some(PeriodicTask::spawn(
            "keyed_sweep",
            clock,
            sweep_interval,
            Arc::downgrade(&keyed.registry),
            |registry: &Registry<L>| {
                registry.sweep();
            },
        ));
        Ok(keyed)
    }

    /// Create a registry that is only swept by [`sweep_idle`](Self::sweep_idle).
    pub fn new_manual<F>(factory: F, idle_timeout: Duration, clock: SharedClock) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<Arc<L>, ConfigError> + Send + Sync + 'static,
    {
        if idle_timeout.is_zero() {
            return Err(ConfigError::ZeroSweep);
        }
        Ok(Self {
            registry: Arc::new(Registry {
                entries: DashMap::new(),
                factory: Box::new(factory),
                idle_timeout: nanos(idle_timeout),
                clock,
            }),
            _sweeper: None,
        })
    }

    /// The limiter for `key`, created on first use.
    ///
    /// Concurrent first calls for the same key all receive the same
    /// instance. The factory runs outside any registry lock; if two callers
    /// race, the losing instance is discarded unused.
    pub fn for_key(&self, key: &str) -> Result<Arc<L>, ConfigError> {
        let registry = &self.registry;
        let now = registry.clock.now();

        if let Some(entry) = registry.entries.get(key) {
            entry.last_access.fetch_max(now, Ordering::Relaxed);
            return Ok(entry.limiter.clone());
        }

        let candidate = (registry.factory)(key)?;
        let entry = registry.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating limiter for key");
            Entry {
                limiter: candidate,
                last_access: AtomicU64::new(now),
            }
        });
        entry.last_access.fetch_max(now, Ordering::Relaxed);
        Ok(entry.limiter.clone())
    }

    /// Remove idle keys now; returns how many were removed.
    ///
    /// A key is idle once it has not been looked up for the idle timeout, no
    /// caller still holds its limiter and the limiter has nothing in flight
    /// or queued.
    pub fn sweep_idle(&self) -> usize {
        self.registry.sweep()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.registry.entries.contains_key(key)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.registry.idle_timeout)
    }
}

impl KeyedLimiter<dyn Limiter> {
    /// Build a registry from configuration, honoring per-key overrides.
    ///
    /// Every configuration is validated up front, so a bad override fails
    /// here rather than on the key's first request.
    pub fn from_config(
        limiter: &LimiterConfig,
        keyed: &KeyedConfig,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        limiter.validate()?;
        keyed.validate()?;

        let default = limiter.clone();
        let keyed_config = keyed.clone();
        let factory_clock = clock.clone();
        Self::new(
            move |key: &str| {
                build_limiter(keyed_config.limiter_for(key, &default), factory_clock.clone())
            },
            keyed.idle_timeout(),
            keyed.sweep_interval(),
            clock,
        )
    }
}

impl<L: ?Sized + Limiter + 'static> std::fmt::Debug for KeyedLimiter<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLimiter")
            .field("keys", &self.registry.entries.len())
            .field("idle_timeout", &self.idle_timeout())
            .field("sweeping", &self._sweeper.is_some())
            .finish()
    }
}
