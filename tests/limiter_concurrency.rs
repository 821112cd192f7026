// Limiter integration tests
//
// Time-dependent tests run on tokio's paused clock, so grant instants are
// exact multiples of the refill interval. Drain jitter is disabled.

use futures::future::join_all;
use ratekeeper::error::CoordinatorError;
use ratekeeper::rate_limit::{
    AcquireOptions, CancelToken, LimiterSettings, MemoryBucketStore, OperationRegistry,
    RateLimitConfig, RateLimiter, StoreFailurePolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn limiter(configs: Vec<RateLimitConfig>) -> RateLimiter {
    RateLimiter::new(
        OperationRegistry::new(configs).unwrap(),
        Arc::new(MemoryBucketStore::new()),
        LimiterSettings {
            default_timeout: Duration::from_secs(120),
            queue_jitter: Duration::ZERO,
            failure_policy: StoreFailurePolicy::FailClosed,
        },
    )
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_never_over_issue() {
    let limiter = limiter(vec![RateLimitConfig::new("catalog.get_item", 2.0, 2)]);
    let start = Instant::now();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire("catalog.get_item", 1).await.unwrap();
                start.elapsed()
            })
        })
        .collect();

    let mut grants: Vec<Duration> = join_all(tasks)
        .await
        .into_iter()
        .map(|grant| grant.unwrap())
        .collect();
    grants.sort();

    let expected: Vec<Duration> = [0, 0, 500, 1000, 1500, 2000, 2500, 3000, 3500, 4000]
        .into_iter()
        .map(ms)
        .collect();
    assert_eq!(grants, expected);
}

#[tokio::test(start_paused = true)]
async fn test_min_delay_spaces_queued_grants() {
    let limiter = limiter(vec![RateLimitConfig::new("fees.estimate", 2.0, 2).min_delay_ms(500)]);
    let start = Instant::now();

    let mut grants = Vec::new();
    for _ in 0..4 {
        limiter.acquire("fees.estimate", 1).await.unwrap();
        grants.push(start.elapsed());
    }

    assert_eq!(grants, vec![ms(0), ms(0), ms(500), ms(1000)]);
}

#[tokio::test(start_paused = true)]
async fn test_min_delay_dominates_fast_refill() {
    // Refill alone would allow a queued grant every 100ms
    let limiter = limiter(vec![RateLimitConfig::new("op", 10.0, 5).min_delay_ms(300)]);
    let start = Instant::now();

    let tasks: Vec<_> = (0..7)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire("op", 1).await.unwrap();
                start.elapsed()
            })
        })
        .collect();

    let mut grants = Vec::new();
    for task in tasks {
        grants.push(task.await.unwrap());
    }
    grants.sort();

    assert_eq!(&grants[..5], &[ms(0); 5]);
    assert_eq!(&grants[5..], &[ms(300), ms(600)]);
}

#[tokio::test(start_paused = true)]
async fn test_min_delay_holds_after_queue_drains() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 10.0, 5).min_delay_ms(300)]);
    let start = Instant::now();

    let mut grants = Vec::new();
    for _ in 0..8 {
        limiter.acquire("op", 1).await.unwrap();
        grants.push(start.elapsed());
    }

    // Once a caller has queued, later callers keep the spacing even though
    // each finds the queue empty
    assert_eq!(&grants[..5], &[ms(0); 5]);
    assert_eq!(&grants[5..], &[ms(300), ms(600), ms(900)]);
}

#[tokio::test(start_paused = true)]
async fn test_queue_is_fifo() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 1.0, 1)]);
    limiter.acquire("op", 1).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..5u32 {
        let limiter = limiter.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            limiter.acquire("op", 1).await.unwrap();
            tx.send(id).unwrap();
        });
        // Fix the enqueue order
        tokio::time::sleep(ms(1)).await;
    }
    drop(tx);

    let mut order = Vec::new();
    while let Some(id) = rx.recv().await {
        order.push(id);
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_small_request_does_not_overtake_large_head() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 1.0, 3)]);
    let start = Instant::now();
    limiter.acquire("op", 3).await.unwrap();

    let large = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.acquire("op", 3).await.unwrap();
            start.elapsed()
        })
    };
    tokio::time::sleep(ms(1)).await;
    let small = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.acquire("op", 1).await.unwrap();
            start.elapsed()
        })
    };

    assert_eq!(large.await.unwrap(), ms(3000));
    assert_eq!(small.await.unwrap(), ms(4000));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_releases_its_slot() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 1.0, 1)]);
    let start = Instant::now();
    limiter.acquire("op", 1).await.unwrap();

    let cancel = CancelToken::new();
    let cancelled = {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = limiter
                .acquire_with("op", AcquireOptions::new(1).cancel(cancel))
                .await;
            (result, start.elapsed())
        })
    };
    tokio::time::sleep(ms(1)).await;
    let next = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.acquire("op", 1).await.unwrap();
            start.elapsed()
        })
    };

    tokio::time::sleep(ms(199)).await;
    cancel.cancel();

    let (result, at) = cancelled.await.unwrap();
    assert!(matches!(result, Err(CoordinatorError::Cancelled(_))));
    assert_eq!(at, ms(200));

    // The next caller takes the slot the cancelled one would have had
    assert_eq!(next.await.unwrap(), ms(1000));

    // And the cancelled caller consumed nothing
    limiter.acquire("op", 1).await.unwrap();
    assert_eq!(start.elapsed(), ms(2000));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_waiter_consumes_nothing() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 1.0, 1)]);
    let start = Instant::now();
    limiter.acquire("op", 1).await.unwrap();

    let err = limiter
        .acquire_with("op", AcquireOptions::new(1).timeout(ms(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Timeout { .. }));
    assert!(err.is_recoverable());

    limiter.acquire("op", 1).await.unwrap();
    assert_eq!(start.elapsed(), ms(1000));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_is_skipped() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 1.0, 1)]);
    let start = Instant::now();
    limiter.acquire("op", 1).await.unwrap();

    let dropped = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire("op", 1).await })
    };
    tokio::time::sleep(ms(10)).await;
    dropped.abort();
    assert!(dropped.await.unwrap_err().is_cancelled());

    limiter.acquire("op", 1).await.unwrap();
    assert_eq!(start.elapsed(), ms(1000));
    assert_eq!(limiter.queue_length("op").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_operations_are_independent() {
    let limiter = limiter(vec![
        RateLimitConfig::new("slow", 0.01, 1),
        RateLimitConfig::new("fast", 100.0, 1),
    ]);
    limiter.acquire("slow", 1).await.unwrap();

    let slow = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire("slow", 1).await })
    };
    tokio::time::sleep(ms(1)).await;

    let start = Instant::now();
    for _ in 0..5 {
        limiter.acquire("fast", 1).await.unwrap();
    }
    assert!(start.elapsed() < ms(100));
    assert_eq!(limiter.queue_length("slow").await.unwrap(), 1);

    slow.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_over_issue_across_threads() {
    let limiter = limiter(vec![RateLimitConfig::new("op", 0.001, 10)]);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .acquire_with("op", AcquireOptions::new(1).timeout(ms(100)))
                    .await
            })
        })
        .collect();

    let mut granted = 0;
    let mut timed_out = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => granted += 1,
            Err(CoordinatorError::Timeout { .. }) => timed_out += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(granted, 10);
    assert_eq!(timed_out, 40);
    assert_eq!(limiter.queue_length("op").await.unwrap(), 0);
}
