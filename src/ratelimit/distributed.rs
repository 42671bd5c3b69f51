//! Distributed rate limiter backed by a shared counter store.
//!
//! Every node runs its own `DistributedLimiter` against the same
//! [`CounterStore`]. Counts are kept per key and per aligned window, so all
//! nodes sharing a store and a clock timeline enforce one limit together.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::{nanos, Nanos, SharedClock};
use crate::config::{validate_shape, DistributedConfig, LimiterConfig, LimiterKind};
use crate::error::{ConfigError, StoreError};
use crate::store::{CounterKey, CounterStore};

/// The result of one distributed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    /// Hits left in the current window after this check
    pub remaining: u64,
    /// Time until the current window ends
    pub reset_after: Duration,
}

/// A per-key fixed window limiter whose counters live in a [`CounterStore`].
#[derive(Debug)]
pub struct DistributedLimiter {
    node_id: String,
    limit: u64,
    window: Nanos,
    clock: SharedClock,
    store: Arc<dyn CounterStore>,
}

impl DistributedLimiter {
    /// Create a limiter with a random node id.
    pub fn new(
        limit: u64,
        window: Duration,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        validate_shape(LimiterKind::FixedWindow, limit, window)?;
        Ok(Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            limit,
            window: nanos(window),
            clock,
            store,
        })
    }

    /// Create a limiter from a limiter configuration.
    ///
    /// `capacity` is the limit per window and `period_ms` the window length,
    /// whatever `kind` says.
    pub fn from_config(
        config: &LimiterConfig,
        distributed: Option<&DistributedConfig>,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let limiter = Self::new(config.capacity, config.period(), store, clock)?;
        Ok(match distributed.and_then(|d| d.node_id.as_deref()) {
            Some(node_id) => limiter.with_node_id(node_id),
            None => limiter,
        })
    }

    /// Builder-style: set the node id reported in diagnostics.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Check the limit for `key`, counting `hits` against it.
    ///
    /// The hits are counted even when the check fails, matching how a shared
    /// store sees concurrent nodes: the increment and the comparison are one
    /// step.
    pub async fn check(&self, key: &str, hits: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now();
        // Floor to window start
        let window_start = now - now % self.window;
        let counter_key = CounterKey::new(key, window_start);

        trace!(
            node = %self.node_id,
            key = %key,
            window = window_start,
            hits = hits,
            "Checking distributed rate limit"
        );

        let current_count = self
            .store
            .increment(&counter_key, self.window(), hits)
            .await?;

        let allowed = current_count <= self.limit;
        let remaining = self.limit.saturating_sub(current_count);
        let window_end = window_start.saturating_add(self.window);
        let reset_after = Duration::from_nanos(window_end.saturating_sub(now));

        if !allowed {
            debug!(
                node = %self.node_id,
                key = %key,
                count = current_count,
                limit = self.limit,
                "Distributed rate limit exceeded"
            );
        }

        Ok(Decision {
            allowed,
            limit: self.limit,
            remaining,
            reset_after,
        })
    }

    /// Hits counted for `key` in the current window across all nodes.
    pub async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let counter_key = CounterKey::new(key, now - now % self.window);
        self.store.get(&counter_key).await
    }

    /// Forget everything counted for `key`.
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        debug!(node = %self.node_id, key = %key, "Resetting distributed counter");
        self.store.reset(key).await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window)
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;
    use async_trait::async_trait;

    fn node(
        limit: u64,
        store: &Arc<InMemoryCounterStore>,
        clock: &ManualClock,
    ) -> DistributedLimiter {
        DistributedLimiter::new(limit, Duration::from_secs(1), store.clone(), clock.shared())
            .unwrap()
    }

    #[derive(Debug)]
    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn increment(&self, _: &CounterKey, _: Duration, _: u64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _: &CounterKey) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn reset(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_distributed_limiter_check() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = node(5, &store, &clock);

        // Make 5 requests (should all be OK)
        for i in 1..=5 {
            let decision = limiter.check("api_key", 1).await.unwrap();
            assert!(decision.allowed, "Request {} should be OK", i);
            assert_eq!(decision.remaining, 5 - i);
        }

        // 6th request should be over limit
        let decision = limiter.check("api_key", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_nodes_share_one_limit() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryCounterStore::new());
        let first = node(10, &store, &clock).with_node_id("node-1");
        let second = node(10, &store, &clock).with_node_id("node-2");

        assert!(first.check("tenant", 5).await.unwrap().allowed);
        assert!(second.check("tenant", 3).await.unwrap().allowed);
        assert_eq!(first.count("tenant").await.unwrap(), 8);

        assert!(first.check("tenant", 2).await.unwrap().allowed);
        assert!(!second.check("tenant", 1).await.unwrap().allowed);

        // Other keys are untouched
        assert!(second.check("other", 10).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_rollover() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = node(2, &store, &clock);

        clock.advance(Duration::from_millis(750));
        assert!(limiter.check("key", 2).await.unwrap().allowed);
        let decision = limiter.check("key", 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reset_after, Duration::from_millis(250));

        clock.advance(Duration::from_millis(250));
        let decision = limiter.check("key", 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_after, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = node(1, &store, &clock);

        assert!(limiter.check("key", 1).await.unwrap().allowed);
        limiter.reset("key").await.unwrap();
        assert!(limiter.check("key", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let clock = ManualClock::new();
        let limiter = DistributedLimiter::new(
            5,
            Duration::from_secs(1),
            Arc::new(UnavailableStore),
            clock.shared(),
        )
        .unwrap();

        let err = limiter.check("key", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_node_id_from_config() {
        let clock = ManualClock::new();
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let config = LimiterConfig::new(LimiterKind::FixedWindow, 5, Duration::from_secs(1));

        let named = DistributedLimiter::from_config(
            &config,
            Some(&DistributedConfig {
                node_id: Some("edge-1".to_string()),
            }),
            store.clone(),
            clock.shared(),
        )
        .unwrap();
        assert_eq!(named.node_id(), "edge-1");

        let anonymous =
            DistributedLimiter::from_config(&config, None, store, clock.shared()).unwrap();
        assert!(uuid::Uuid::parse_str(anonymous.node_id()).is_ok());
    }
}
