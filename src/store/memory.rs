//! In-process counter store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CounterKey, CounterStore};
use crate::clock::{nanos, Nanos};
use crate::error::StoreError;

/// A [`CounterStore`] for logical nodes living in one process.
///
/// Counters are grouped per logical key. Each increment also drops windows
/// that ended before the previous one, so a key never holds more than two
/// windows of history. Whenever a newer window starts anywhere in the store,
/// every key is pruned the same way and keys left without a live window are
/// forgotten.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, Windows>,
    /// Newest window start seen by any increment
    newest_window: AtomicU64,
}

#[derive(Debug, Default)]
struct Windows {
    length: Nanos,
    counts: BTreeMap<Nanos, u64>,
}

impl Windows {
    /// Drop windows that ended before the one preceding `current`.
    fn expire(&mut self, current: Nanos) -> usize {
        let oldest_kept = current.saturating_sub(self.length);
        let before = self.counts.len();
        self.counts.retain(|&start, _| start >= oldest_kept);
        before - self.counts.len()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logical keys with live counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Prune every key against the window starting at `current`.
    fn expire_stale(&self, current: Nanos) {
        let before = self.counters.len();
        self.counters.retain(|_, windows| {
            windows.expire(current);
            !windows.counts.is_empty()
        });

        let forgotten = before.saturating_sub(self.counters.len());
        if forgotten > 0 {
            debug!(forgotten, remaining = self.counters.len(), "Dropped stale counter keys");
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let total = {
            let mut windows = self.counters.entry(key.key.clone()).or_default();
            windows.length = nanos(window);

            let count = windows.counts.entry(key.window_start).or_insert(0);
            *count = count
                .checked_add(amount)
                .ok_or_else(|| StoreError::Overflow(key.to_store_key()))?;
            let total = *count;

            let expired = windows.expire(key.window_start);
            if expired > 0 {
                debug!(key = %key, expired, "Expired old counter windows");
            }
            total
        };

        // The entry guard is released above; retain locks every shard.
        let previous = self.newest_window.fetch_max(key.window_start, Ordering::AcqRel);
        if key.window_start > previous {
            self.expire_stale(key.window_start);
        }

        trace!(key = %key, amount, total, "Incremented counter");
        Ok(total)
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        Ok(self
            .counters
            .get(&key.key)
            .and_then(|windows| windows.counts.get(&key.window_start).copied())
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.counters.remove(key);
        Ok(())
    }
}
