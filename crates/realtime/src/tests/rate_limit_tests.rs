use std::time::Duration;

use coordination::MemoryStore;

use super::*;

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn allows_up_to_limit_then_rejects_with_hint() {
    let limiter = limiter();
    let limit = Limit::new(3, Duration::from_secs(60));

    for expected_remaining in [2, 1, 0] {
        let decision = limiter.check("send", "1", limit).await.expect("check");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }

    let rejected = limiter.check("send", "1", limit).await.expect("check");
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert!(rejected.retry_after_ms > 0 && rejected.retry_after_ms <= 60_000);
}

#[tokio::test]
async fn keys_and_scopes_are_independent() {
    let limiter = limiter();
    let limit = Limit::new(1, Duration::from_secs(60));
    assert!(limiter.check("send", "1", limit).await.expect("check").allowed);
    assert!(limiter.check("send", "2", limit).await.expect("check").allowed);
    assert!(limiter.check("typing", "1", limit).await.expect("check").allowed);
    assert!(!limiter.check("send", "1", limit).await.expect("check").allowed);
}

#[tokio::test]
async fn window_slides_open_again() {
    let limiter = limiter();
    let limit = Limit::new(1, Duration::from_millis(50));
    limiter.enforce("typing", "1:1", limit).await.expect("first");
    let err = limiter
        .enforce("typing", "1:1", limit)
        .await
        .expect_err("second");
    assert!(matches!(err, RealtimeError::RateLimited { .. }));

    tokio::time::sleep(Duration::from_millis(120)).await;
    limiter.enforce("typing", "1:1", limit).await.expect("reopened");
}
