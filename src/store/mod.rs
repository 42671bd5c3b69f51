//! Shared counter storage.
//!
//! A [`CounterStore`] holds per-key window counters that several logical
//! nodes increment together. The in-memory implementation covers nodes that
//! live in one process; anything crossing a process boundary plugs in behind
//! the same trait.

mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Nanos;
use crate::error::StoreError;

pub use memory::InMemoryCounterStore;

/// Key identifying one window of one logical key's counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The logical key being limited.
    pub key: String,
    /// Start of the window on the shared clock timeline, floored to a
    /// window boundary.
    pub window_start: Nanos,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(key: &str, window_start: Nanos) -> Self {
        Self {
            key: key.to_string(),
            window_start,
        }
    }

    /// Convert to a flat store key.
    /// Format: "counter|{key}|{window_start}"
    pub fn to_store_key(&self) -> String {
        format!("counter|{}|{}", self.key, self.window_start)
    }

    /// Parse from a flat store key.
    pub fn from_store_key(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("counter|")?;

        // Split from the right so keys may contain the delimiter
        let (key, window_start) = rest.rsplit_once('|')?;
        let window_start = window_start.parse().ok()?;

        Some(Self {
            key: key.to_string(),
            window_start,
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.window_start)
    }
}

/// Storage for counters shared between limiter nodes.
///
/// Implementations must make `increment` atomic per key: concurrent
/// increments from different nodes all count, and each caller sees a total
/// that includes its own amount.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Add `amount` to the counter and return the new total for that window.
    ///
    /// `window` is the window length; stores may use it to expire counters
    /// for windows that have ended.
    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
        amount: u64,
    ) -> Result<u64, StoreError>;

    /// Current total for a window without changing it.
    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Drop every window counted for a logical key.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key() {
        let key = CounterKey::new("user:123", 1_704_067_200);
        let raw = key.to_store_key();
        assert_eq!(raw, "counter|user:123|1704067200");

        let parsed = CounterKey::from_store_key(&raw).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_counter_key_with_delimiter() {
        let key = CounterKey::new("tenant|a|b", 42);
        let parsed = CounterKey::from_store_key(&key.to_store_key()).unwrap();
        assert_eq!(parsed.key, "tenant|a|b");
        assert_eq!(parsed.window_start, 42);
    }

    #[test]
    fn test_counter_key_parsing_invalid() {
        assert!(CounterKey::from_store_key("invalid").is_none());
        assert!(CounterKey::from_store_key("counter|nowindow").is_none());
        assert!(CounterKey::from_store_key("counter|key|notanumber").is_none());
        assert!(CounterKey::from_store_key("notcounter|a|123").is_none());
    }
}
