mod common;

use anyhow::anyhow;
use gramlink::{RateLimitError, RateLimiter, RateLimiterConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};

fn limiter(min_interval_ms: u64, max_queue_len: usize) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimiterConfig {
        min_interval_ms,
        max_queue_len,
    }))
}

type BoxFut = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<u32>> + Send>>;

/// Operation that records its id in `order` and returns it.
fn recording_op(id: u32, order: &Arc<Mutex<Vec<u32>>>) -> impl FnOnce() -> BoxFut + Send + 'static {
    let order = Arc::clone(order);
    move || -> BoxFut {
        Box::pin(async move {
            order.lock().unwrap().push(id);
            Ok(id)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn dispatches_are_paced_and_fifo_for_equal_priority() {
    common::init_test_logging();
    let limiter = limiter(100, 100);
    let order = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    let (r0, r1, r2, r3, r4) = tokio::join!(
        limiter.execute(recording_op(0, &order), false),
        limiter.execute(recording_op(1, &order), false),
        limiter.execute(recording_op(2, &order), false),
        limiter.execute(recording_op(3, &order), false),
        limiter.execute(recording_op(4, &order), false),
    );

    // Five dispatches at a 100 ms minimum interval span at least 400 ms.
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert_eq!(
        (
            r0.unwrap(),
            r1.unwrap(),
            r2.unwrap(),
            r3.unwrap(),
            r4.unwrap()
        ),
        (0, 1, 2, 3, 4)
    );
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn priority_requests_jump_the_queue_and_are_lifo_among_themselves() {
    let limiter = limiter(100, 100);
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));

    // Occupy the worker so everything below queues up behind request 0.
    let first = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            limiter
                .execute(
                    move || async move {
                        let permit = gate.acquire().await.unwrap();
                        permit.forget();
                        order.lock().unwrap().push(0);
                        Ok(0)
                    },
                    false,
                )
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;

    let rest = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            tokio::join!(
                limiter.execute(recording_op(1, &order), false),
                limiter.execute(recording_op(2, &order), false),
                limiter.execute(recording_op(3, &order), true),
                limiter.execute(recording_op(4, &order), true),
            )
        })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(limiter.queue_len(), 4);

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    let (r1, r2, r3, r4) = rest.await.unwrap();
    for result in [r1, r2, r3, r4] {
        result.unwrap();
    }

    // Priority requests dispatch before earlier normal ones, newest first;
    // normal requests keep their submission order.
    assert_eq!(*order.lock().unwrap(), vec![0, 4, 3, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_new_work_without_disturbing_queued_items() {
    let limiter = limiter(100, 2);
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            limiter
                .execute(
                    move || async move {
                        let permit = gate.acquire().await.unwrap();
                        permit.forget();
                        order.lock().unwrap().push(0);
                        Ok(0)
                    },
                    false,
                )
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;

    let queued_one = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        tokio::spawn(async move { limiter.execute(recording_op(1, &order), false).await })
    };
    let queued_two = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        tokio::spawn(async move { limiter.execute(recording_op(2, &order), false).await })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(limiter.queue_len(), 2);

    let err = limiter
        .execute(recording_op(3, &order), false)
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<RateLimitError>(),
        Some(&RateLimitError::QueueFull { capacity: 2 })
    );

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    queued_one.await.unwrap().unwrap();
    queued_two.await.unwrap().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn clear_queue_cancels_pending_but_not_in_flight_work() {
    let limiter = limiter(100, 100);
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));

    let in_flight = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            limiter
                .execute(
                    move || async move {
                        let permit = gate.acquire().await.unwrap();
                        permit.forget();
                        order.lock().unwrap().push(0);
                        Ok(0)
                    },
                    false,
                )
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;

    let pending_one = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        tokio::spawn(async move { limiter.execute(recording_op(1, &order), false).await })
    };
    let pending_two = {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        tokio::spawn(async move { limiter.execute(recording_op(2, &order), false).await })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(limiter.queue_len(), 2);

    limiter.clear_queue();
    assert_eq!(limiter.queue_len(), 0);

    for pending in [pending_one, pending_two] {
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<RateLimitError>(),
            Some(&RateLimitError::Cancelled)
        );
    }

    // The dispatched operation is unaffected by the clear.
    gate.add_permits(1);
    assert_eq!(in_flight.await.unwrap().unwrap(), 0);
    assert_eq!(*order.lock().unwrap(), vec![0]);
}

#[tokio::test]
async fn operation_errors_pass_through_without_retry() {
    let limiter = limiter(100, 10);
    let calls = Arc::new(Mutex::new(0u32));

    let err = {
        let calls = Arc::clone(&calls);
        limiter
            .execute(
                move || async move {
                    *calls.lock().unwrap() += 1;
                    Err::<u32, _>(anyhow!("FLOOD_WAIT_3"))
                },
                false,
            )
            .await
            .unwrap_err()
    };

    assert!(err.to_string().contains("FLOOD_WAIT_3"));
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn min_interval_is_clamped_to_the_floor() {
    let limiter = limiter(5, 10);
    assert_eq!(limiter.min_interval(), Duration::from_millis(100));

    limiter.set_min_interval(Duration::from_secs(2));
    assert_eq!(limiter.min_interval(), Duration::from_secs(2));

    limiter.set_min_interval(Duration::from_millis(50));
    assert_eq!(limiter.min_interval(), Duration::from_millis(100));
}
