//! Integration tests for the daily rate limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use crawlnode::limiter::RateLimiter;
use crawlnode::store::MemoryStore;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn limiter(cap: u32) -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryStore::new()), cap, DAY).unwrap()
}

#[tokio::test]
async fn cap_checks_proceed_and_the_next_is_refused() {
    let limiter = limiter(500);
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();

    for n in 1..=499 {
        let d = limiter.check_at(t0).await.unwrap();
        assert!(d.proceed, "check {n} should proceed");
        assert!(!d.is_last_count, "check {n} is not the last");
    }

    let last = limiter.check_at(t0).await.unwrap();
    assert!(last.proceed);
    assert!(last.is_last_count);
    assert_eq!(last.count, 500);
    assert!(limiter.limit_reached().await.unwrap());

    let refused = limiter.check_at(t0).await.unwrap();
    assert!(!refused.proceed);
    assert!(!refused.is_last_count);
}

#[tokio::test]
async fn check_after_window_expiry_resets_count_to_one() {
    let limiter = limiter(500);
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    for _ in 0..501 {
        limiter.check_at(t0).await.unwrap();
    }
    assert!(limiter.limit_reached().await.unwrap());

    let later = t0 + chrono::Duration::hours(24) + chrono::Duration::seconds(1);
    let d = limiter.check_at(later).await.unwrap();
    assert!(d.proceed);
    assert_eq!(d.count, 1);
    assert!(!limiter.limit_reached().await.unwrap());

    let state = limiter.state().await.unwrap().unwrap();
    assert_eq!(state.window_start, later);
}

#[tokio::test]
async fn window_of_exactly_the_refresh_interval_does_not_roll_over() {
    let limiter = limiter(10);
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    limiter.check_at(t0).await.unwrap();

    let d = limiter.check_at(t0 + chrono::Duration::hours(24)).await.unwrap();
    assert_eq!(d.count, 2);
    assert!(!limiter.window_expired_at(t0 + chrono::Duration::hours(24)).await.unwrap());
    assert!(
        limiter
            .window_expired_at(t0 + chrono::Duration::hours(24) + chrono::Duration::milliseconds(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn two_rapid_checks_at_499_give_last_then_refused() {
    let limiter = limiter(500);
    let window_start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    for _ in 0..499 {
        limiter.check_at(window_start).await.unwrap();
    }

    let now = window_start + chrono::Duration::hours(1);
    let first = limiter.check_at(now).await.unwrap();
    assert!(first.proceed);
    assert!(first.is_last_count);
    assert!(limiter.limit_reached().await.unwrap());

    let second = limiter.check_at(now).await.unwrap();
    assert!(!second.proceed);

    assert_eq!(
        limiter.reopens_at().await.unwrap(),
        Some(window_start + chrono::Duration::hours(24))
    );
}

#[tokio::test]
async fn reset_window_clears_flag_and_count() {
    let limiter = limiter(2);
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    limiter.check_at(t0).await.unwrap();
    limiter.check_at(t0).await.unwrap();
    assert!(limiter.limit_reached().await.unwrap());

    let t1 = t0 + chrono::Duration::minutes(5);
    limiter.reset_window(t1).await.unwrap();
    assert!(!limiter.limit_reached().await.unwrap());
    assert_eq!(limiter.reopens_at().await.unwrap(), None);

    let d = limiter.check_at(t1).await.unwrap();
    assert!(d.proceed);
    assert_eq!(d.count, 1);
}

#[tokio::test]
async fn mark_limit_reached_keeps_an_existing_flag() {
    let limiter = limiter(1);
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    limiter.check_at(t0).await.unwrap();
    assert!(limiter.limit_reached().await.unwrap());

    limiter.mark_limit_reached(t0 + chrono::Duration::hours(2)).await.unwrap();
    assert!(limiter.limit_reached().await.unwrap());
}
