//! Exercises every strategy through the uniform `Limiter` interface.

use std::sync::Arc;
use std::time::Duration;

use floodgate::clock::{ManualClock, TokioClock};
use floodgate::config::{EngineConfig, LimiterConfig, LimiterKind};
use floodgate::error::AcquireError;
use floodgate::ratelimit::{
    build_limiter, AdaptiveLimiter, Admission, DistributedLimiter, KeyedLimiter, Limiter, Outcome,
};
use floodgate::store::{CounterStore, InMemoryCounterStore};
use tokio::time::Instant;

fn config(kind: LimiterKind, capacity: u64, period_ms: u64) -> LimiterConfig {
    LimiterConfig::new(kind, capacity, Duration::from_millis(period_ms))
}

/// Count how many of `attempts` single-unit requests are admitted right now.
fn admitted(limiter: &dyn Limiter, attempts: usize) -> usize {
    (0..attempts)
        .filter_map(|_| limiter.try_admit(1))
        .map(|admission| admission.release(Outcome::Success))
        .count()
}

#[test]
fn test_token_bucket_scenario() {
    let clock = ManualClock::new();
    let limiter = build_limiter(&config(LimiterKind::TokenBucket, 5, 200), clock.shared()).unwrap();

    for _ in 0..5 {
        assert!(limiter.try_admit(1).is_some());
    }
    assert!(limiter.try_admit(1).is_none());

    clock.advance(Duration::from_millis(200));
    assert!(limiter.try_admit(1).is_some());
}

#[test]
fn test_counter_strategies_swap_through_config() {
    for kind in [
        LimiterKind::TokenBucket,
        LimiterKind::FixedWindow,
        LimiterKind::SlidingWindow,
    ] {
        let clock = ManualClock::new();
        let limiter = build_limiter(&config(kind, 3, 1000), clock.shared()).unwrap();

        assert_eq!(admitted(limiter.as_ref(), 10), 3, "{kind} admits its capacity");
        clock.advance(Duration::from_millis(1001));
        assert!(admitted(limiter.as_ref(), 10) >= 1, "{kind} recovers over time");
    }
}

#[tokio::test(start_paused = true)]
async fn test_counter_admit_waits_in_virtual_time() {
    let limiter = build_limiter(
        &config(LimiterKind::SlidingWindow, 2, 500),
        TokioClock::shared(),
    )
    .unwrap();
    let start = Instant::now();

    for _ in 0..4 {
        limiter.admit(1, None).await.unwrap().release(Outcome::Success);
    }
    assert!(start.elapsed() > Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_leaky_bucket_releases_at_drain_rate() {
    let limiter = build_limiter(&config(LimiterKind::LeakyBucket, 2, 100), TokioClock::shared())
        .unwrap();
    let start = Instant::now();

    let first = limiter.try_admit(1).unwrap();
    let second = limiter.try_admit(1).unwrap();
    assert!(first.is_queued());
    assert!(limiter.try_admit(1).is_none());

    first.ready(None).await.unwrap().release(Outcome::Success);
    assert!(start.elapsed() >= Duration::from_millis(100));

    second.ready(None).await.unwrap().release(Outcome::Success);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_leaky_bucket_admit_rejects_when_full() {
    let limiter = build_limiter(&config(LimiterKind::LeakyBucket, 1, 100), TokioClock::shared())
        .unwrap();
    let _queued = limiter.try_admit(1).unwrap();

    let err = limiter.admit(1, None).await.unwrap_err();
    assert!(matches!(err, AcquireError::Rejected(_)));

    let err = limiter.admit(2, None).await.unwrap_err();
    assert_eq!(err, AcquireError::Unsatisfiable { cost: 2, capacity: 1 });
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_admit_times_out_then_succeeds() {
    let limiter = build_limiter(&config(LimiterKind::Concurrency, 1, 0), TokioClock::shared())
        .unwrap();
    let held = limiter.admit(1, None).await.unwrap();
    assert!(matches!(held, Admission::Permit(_)));

    let err = limiter
        .admit(1, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err, AcquireError::Timeout(Duration::from_millis(50)));

    let waiter = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.admit(1, Some(Duration::from_secs(1))).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    held.release(Outcome::Success);

    let admission = waiter.await.unwrap().unwrap();
    admission.release(Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_adaptive_grows_on_success_through_facade() {
    let limiter = Arc::new(
        AdaptiveLimiter::from_config(
            &config(LimiterKind::Adaptive, 4, 100),
            TokioClock::shared(),
        )
        .unwrap(),
    );
    let facade: Arc<dyn Limiter> = limiter.clone();
    assert_eq!(limiter.limit(), 1);

    for _ in 0..3 {
        for _ in 0..10 {
            let admission = facade.admit(1, None).await.unwrap();
            admission.release(Outcome::Success);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(limiter.limit(), 4);

    for _ in 0..5 {
        for _ in 0..10 {
            facade.admit(1, None).await.unwrap().release(Outcome::Failure);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(limiter.limit(), 1);
}

#[tokio::test]
async fn test_keyed_isolation_from_yaml() {
    let yaml = r#"
limiter:
  kind: fixed_window
  capacity: 2
  period_ms: 1000
keyed:
  idle_timeout_ms: 60000
  sweep_interval_ms: 1000
  overrides:
    vip:
      kind: token_bucket
      capacity: 5
      period_ms: 1000
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    let clock = ManualClock::new();
    let keyed = KeyedLimiter::from_config(
        &config.limiter,
        config.keyed.as_ref().unwrap(),
        clock.shared(),
    )
    .unwrap();

    let a = keyed.for_key("a").unwrap();
    assert_eq!(admitted(a.as_ref(), 10), 2);

    // Exhausting "a" leaves "b" untouched
    let b = keyed.for_key("b").unwrap();
    assert_eq!(admitted(b.as_ref(), 10), 2);

    let vip = keyed.for_key("vip").unwrap();
    assert_eq!(vip.kind(), LimiterKind::TokenBucket);
    assert_eq!(admitted(vip.as_ref(), 10), 5);
}

#[tokio::test]
async fn test_distributed_nodes_share_store() {
    let clock = ManualClock::new();
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let limit = config(LimiterKind::FixedWindow, 6, 1000);

    let nodes: Vec<_> = (0..3)
        .map(|i| {
            DistributedLimiter::from_config(&limit, None, store.clone(), clock.shared())
                .unwrap()
                .with_node_id(format!("node-{i}"))
        })
        .collect();

    let mut allowed = 0;
    for request in 0..12 {
        if nodes[request % 3].check("tenant", 1).await.unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 6);

    clock.advance(Duration::from_secs(1));
    assert!(nodes[0].check("tenant", 1).await.unwrap().allowed);
}
