use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use parking_lot::Mutex;
use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 50.0;
pub const DEFAULT_BURST: u32 = 300;

/// Decides how long a failing item waits before it is handed out again.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`. Every call counts as one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Drop any failure history of `item`.
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

struct ItemBackoff {
    backoff: ExponentialBackoff,
    failures: u32,
}

/// Per-item exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `max`.
pub struct ItemExponentialRateLimiter<T> {
    base: Duration,
    max: Duration,
    items: Mutex<HashMap<T, ItemBackoff>>,
}

impl<T> ItemExponentialRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            items: Mutex::default(),
        }
    }

    fn build_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base)
            .with_max_delay(self.max)
            .without_max_times()
            .build()
    }
}

impl<T> RateLimiter<T> for ItemExponentialRateLimiter<T>
where
    T: Eq + Hash + Clone + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut items = self.items.lock();
        let entry = items.entry(item.clone()).or_insert_with(|| ItemBackoff {
            backoff: self.build_backoff(),
            failures: 0,
        });
        entry.failures += 1;
        // without_max_times never exhausts, the fallback only guards the cap
        entry.backoff.next().unwrap_or(self.max)
    }

    fn forget(&self, item: &T) {
        self.items.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.items
            .lock()
            .get(item)
            .map_or(0, |entry| entry.failures)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every item of a queue. Each call reserves one token and returns how
/// long the caller has to wait for it, so a burst of failures is spread over time.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Delay is the maximum of every wrapped limiter.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, item: &T) {
        self.limiters.iter().for_each(|limiter| limiter.forget(item));
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or_default()
    }
}

/// Per-item backoff from 5ms to 1000s combined with a 50 qps / 300 burst bucket for the queue.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}
