//! Interval rate limiter with an injectable clock.
//!
//! One limiter paces all outbound calls (model requests and webhook posts)
//! made on behalf of a single account: consecutive permits are handed out at
//! least `interval` apart. The first permit is immediate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

/// Monotonic time source. `now()` is the elapsed time since the clock's origin.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `tokio::time`.
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` advances time instantly and records the request.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without sleeping.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Leaky-bucket limiter releasing one permit per `interval`.
pub struct RateLimiter {
    interval: Duration,
    clock: Arc<dyn Clock>,
    next_slot: Mutex<Option<Duration>>,
}

impl RateLimiter {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until the next permit is available.
    ///
    /// The slot is reserved before sleeping, so concurrent callers queue up
    /// behind each other instead of bursting together.
    pub async fn acquire(&self) {
        let wait = {
            let now = self.clock.now();
            let Ok(mut next) = self.next_slot.lock() else {
                return;
            };
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot - now
        };
        if !wait.is_zero() {
            self.clock.sleep(wait).await;
        }
    }
}
