//! Inter-item pacing for rate-limited downstream services.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// What the action observed about the downstream rate limit for one item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PaceSignal {
    #[default]
    Normal,
    /// Downstream asked us to back off for at least this long.
    RateLimited(Duration),
}

/// Called by the pipeline after every item, unconditionally.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn after_item(&self, signal: PaceSignal);
}

/// No fixed delay; only explicit back-off requests are honored.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPacing;

#[async_trait]
impl Pacer for NoPacing {
    async fn after_item(&self, signal: PaceSignal) {
        if let PaceSignal::RateLimited(wait) = signal {
            sleep(wait).await;
        }
    }
}

/// Sleep a fixed delay after each item (plus any requested back-off).
#[derive(Clone, Copy, Debug)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl Pacer for FixedDelay {
    async fn after_item(&self, signal: PaceSignal) {
        let wait = match signal {
            PaceSignal::Normal => self.0,
            PaceSignal::RateLimited(d) => d.max(self.0),
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket: bursts up to `capacity` items, then one item per refill period.
///
/// A rate-limit signal empties the bucket and waits out the requested time, so
/// the next items are spread out again.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, per_item: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: 1.0 / per_item.as_secs_f64().max(1e-9),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take a token at `now`; returns how long to wait before the next item.
    fn reserve_at(&self, b: &mut Bucket, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(b.last_update).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        b.last_update = now;

        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-b.tokens / self.refill_per_sec)
    }
}

#[async_trait]
impl Pacer for TokenBucket {
    async fn after_item(&self, signal: PaceSignal) {
        let wait = {
            let mut b = self.bucket.lock().await;
            let now = Instant::now();
            match signal {
                PaceSignal::Normal => self.reserve_at(&mut b, now),
                PaceSignal::RateLimited(retry_after) => {
                    // Drain and restart refilling once the back-off has elapsed.
                    b.tokens = 0.0;
                    b.last_update = now + retry_after;
                    retry_after
                }
            }
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}
