//! Serialized, paced execution queue for outbound API calls.
//!
//! One worker task drains the queue; consecutive dispatches are separated by
//! at least the configured minimum interval. Queue order is FIFO, except
//! priority requests are inserted at the head, so repeated priority
//! insertions are LIFO relative to each other (each new priority request
//! jumps the whole line, including earlier priority requests).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Pacing slower than this is not meaningful; requests would starve.
const MIN_INTERVAL_FLOOR: Duration = Duration::from_millis(100);

/// Capacity and pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Minimum gap between consecutive dispatches, in milliseconds.
    pub min_interval_ms: u64,
    /// Hard cap on queued (not yet dispatched) requests.
    pub max_queue_len: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_queue_len: 10_000,
        }
    }
}

/// Capacity and cancellation failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit queue is full ({capacity} requests pending)")]
    QueueFull { capacity: usize },

    #[error("request cancelled: queue was cleared before dispatch")]
    Cancelled,
}

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct QueuedRequest {
    id: Uuid,
    priority: bool,
    queued_at: Instant,
    job: Job,
}

struct LimiterShared {
    queue: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
    min_interval_ms: AtomicU64,
    max_queue_len: usize,
}

/// Bounded, priority-aware execution queue with a single paced consumer.
pub struct RateLimiter {
    shared: Arc<LimiterShared>,
    worker: JoinHandle<()>,
}

impl RateLimiter {
    /// Spawn the consumer task. Must be called within a tokio runtime.
    pub fn new(config: RateLimiterConfig) -> Self {
        let min_interval = clamp_interval(Duration::from_millis(config.min_interval_ms));
        let shared = Arc::new(LimiterShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            min_interval_ms: AtomicU64::new(min_interval.as_millis() as u64),
            max_queue_len: config.max_queue_len,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self { shared, worker }
    }

    /// Queue `op` and await its result.
    ///
    /// Fails immediately with [`RateLimitError::QueueFull`] when the queue is
    /// at capacity, without disturbing requests already queued. `priority`
    /// inserts at the head of the queue.
    pub async fn execute<T, F, Fut>(&self, op: F, priority: bool) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                // Receiver may have given up; nothing to do then.
                let _ = tx.send(op().await);
            })
        });
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            priority,
            queued_at: Instant::now(),
            job,
        };

        {
            let mut queue = self.shared.queue.lock().expect("rate limiter mutex poisoned");
            if queue.len() >= self.shared.max_queue_len {
                warn!(
                    capacity = self.shared.max_queue_len,
                    "rejecting request: queue at capacity"
                );
                return Err(RateLimitError::QueueFull {
                    capacity: self.shared.max_queue_len,
                }
                .into());
            }
            debug!(request_id = %request.id, priority, depth = queue.len(), "request queued");
            if priority {
                queue.push_front(request);
            } else {
                queue.push_back(request);
            }
        }
        self.shared.notify.notify_one();

        match rx.await {
            Ok(result) => result,
            // The queued job was dropped before dispatch (queue cleared or
            // limiter shut down).
            Err(_) => Err(RateLimitError::Cancelled.into()),
        }
    }

    /// Drop every request still waiting for dispatch; each caller observes
    /// [`RateLimitError::Cancelled`]. A request already dispatched is not
    /// affected.
    pub fn clear_queue(&self) {
        let drained = {
            let mut queue = self.shared.queue.lock().expect("rate limiter mutex poisoned");
            let drained: Vec<QueuedRequest> = queue.drain(..).collect();
            drained
        };
        if !drained.is_empty() {
            warn!(cancelled = drained.len(), "queue cleared; cancelling pending requests");
        }
        // Dropping the jobs drops their result senders, which settles every
        // waiting caller with a cancellation error.
        drop(drained);
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().expect("rate limiter mutex poisoned").len()
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.shared.min_interval_ms.load(Ordering::Relaxed))
    }

    /// Adjust the pacing interval at runtime, clamped to the 100 ms floor.
    pub fn set_min_interval(&self, interval: Duration) {
        let clamped = clamp_interval(interval);
        self.shared
            .min_interval_ms
            .store(clamped.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    if interval < MIN_INTERVAL_FLOOR {
        warn!(
            requested_ms = interval.as_millis() as u64,
            floor_ms = MIN_INTERVAL_FLOOR.as_millis() as u64,
            "minimum interval below floor; clamping"
        );
        MIN_INTERVAL_FLOOR
    } else {
        interval
    }
}

async fn run_worker(shared: Arc<LimiterShared>) {
    let mut last_dispatch: Option<Instant> = None;

    loop {
        // Park until at least one request is queued.
        loop {
            if !shared.queue.lock().expect("rate limiter mutex poisoned").is_empty() {
                break;
            }
            shared.notify.notified().await;
        }

        // Pace before taking the head, so a priority request arriving during
        // the pause still jumps the line.
        if let Some(last) = last_dispatch {
            let min_interval =
                Duration::from_millis(shared.min_interval_ms.load(Ordering::Relaxed));
            let since = last.elapsed();
            if since < min_interval {
                let wait = min_interval - since;
                debug!(wait_ms = wait.as_millis() as u64, "pacing before next dispatch");
                sleep(wait).await;
            }
        }

        let request = {
            let mut queue = shared.queue.lock().expect("rate limiter mutex poisoned");
            match queue.pop_front() {
                Some(request) => request,
                // Queue was cleared while pacing.
                None => continue,
            }
        };

        debug!(
            request_id = %request.id,
            priority = request.priority,
            queued_ms = request.queued_at.elapsed().as_millis() as u64,
            "dispatching request"
        );
        last_dispatch = Some(Instant::now());

        // Run each job in its own task so a panicking operation cannot take
        // down the consumer loop; still await settling before the next
        // dispatch.
        if let Err(join_err) = tokio::spawn((request.job)()).await {
            error!(request_id = %request.id, error = %join_err, "queued operation panicked");
        }
    }
}
