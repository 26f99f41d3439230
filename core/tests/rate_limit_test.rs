use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use weave_core::{RateLimitConfig, RateLimiter};

fn limiter(max_requests: u32, window_ms: u64, block_duration_ms: u64) -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        max_requests,
        window_ms,
        block_duration_ms,
        sweep_interval_ms: 60_000,
    })
}

#[test]
fn hundred_allowed_then_blocked_until_block_expires() {
    let l = RateLimiter::new(RateLimitConfig::default());
    let t0 = Instant::now();

    for i in 0..100 {
        let d = l.check_at("client", t0);
        assert!(d.allowed, "request {i} should pass");
        assert_eq!(d.remaining, Some(99 - i));
    }

    let denied = l.check_at("client", t0);
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_seconds, Some(300));
    assert_eq!(l.violations("client"), 1);

    // Still blocked even after the window itself has passed.
    let later = l.check_at("client", t0 + Duration::from_secs(120));
    assert!(!later.allowed);
    assert_eq!(later.retry_after_seconds, Some(180));

    let after = l.check_at("client", t0 + Duration::from_secs(300));
    assert!(after.allowed);
    assert_eq!(after.remaining, Some(99));
    assert_eq!(l.violations("client"), 0);
}

#[test]
fn window_slides_with_time() {
    let l = limiter(3, 1_000, 10_000);
    let t0 = Instant::now();
    for ms in [0, 400, 800] {
        assert!(l.check_at("c", t0 + Duration::from_millis(ms)).allowed);
    }
    // The request at t0 has left the window.
    assert!(l.check_at("c", t0 + Duration::from_millis(1_001)).allowed);
    // Three requests remain inside (400, 800, 1001).
    assert!(!l.check_at("c", t0 + Duration::from_millis(1_100)).allowed);
}

#[test]
fn clients_are_tracked_independently() {
    let l = limiter(1, 1_000, 1_000);
    let t0 = Instant::now();
    assert!(l.check_at("a", t0).allowed);
    assert!(!l.check_at("a", t0).allowed);
    assert!(l.check_at("b", t0).allowed);
    assert_eq!(l.tracked_clients(), 2);

    l.reset("a");
    assert!(l.check_at("a", t0).allowed);
}

#[test]
fn sweep_evicts_idle_but_keeps_blocked_clients() {
    let l = limiter(1, 1_000, 60_000);
    let t0 = Instant::now();
    assert!(l.check_at("idle", t0).allowed);
    assert!(l.check_at("blocked", t0).allowed);
    assert!(!l.check_at("blocked", t0).allowed);

    assert_eq!(l.sweep_at(t0 + Duration::from_secs(5)), 1);
    assert_eq!(l.tracked_clients(), 1);
    assert_eq!(l.violations("blocked"), 1);
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_runs_until_dropped() {
    let l = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 10,
        window_ms: 500,
        block_duration_ms: 1_000,
        sweep_interval_ms: 1_000,
    }));
    let sweeper = l.spawn_sweeper();

    l.check("c");
    assert_eq!(l.tracked_clients(), 1);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(l.tracked_clients(), 0);

    drop(sweeper);
    l.check("d");
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(l.tracked_clients(), 1);
}

#[tokio::test(start_paused = true)]
async fn is_blocked_follows_the_clock() {
    let l = limiter(1, 1_000, 2_000);
    l.check("c");
    l.check("c");
    assert!(l.is_blocked("c"));
    tokio::time::sleep(Duration::from_millis(2_001)).await;
    assert!(!l.is_blocked("c"));
}
