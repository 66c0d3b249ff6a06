// 🚦 Rate Limiter - One billing call at a time, spaced by `interval`
//
// A single async mutex holds the completion instant of the previous call.
// Every caller waits for the gate, sleeps the remaining spacing, runs, and
// stamps its own completion time. Nothing is ever dropped, only delayed.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    /// Completion instant of the last operation (None = never ran)
    last_completed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        RateLimiter {
            interval,
            last_completed: Mutex::new(None),
        }
    }

    pub fn from_secs(seconds: u64) -> Self {
        Self::new(Duration::from_secs(seconds))
    }

    /// Run `operation` once the spacing since the previous completion has elapsed.
    pub async fn limit<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last = self.last_completed.lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "rate limiter waiting");
                sleep_until(ready_at).await;
            }
        }

        let result = operation.await;
        *last = Some(Instant::now());
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================
