//! Shared throttle for model calls
//!
//! Combines a concurrency cap (a semaphore) with a fixed minimal spacing
//! between call starts. One limiter is shared by every analysis call so the
//! upstream quota sees a steady request rate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep_until};

/// Fixed-interval limiter with bounded concurrency
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    /// Earliest instant the next call may start
    next_start: Mutex<Instant>,
}

impl RateLimiter {
    /// `max_concurrency` is clamped to at least 1
    pub fn new(max_concurrency: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            min_interval,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Wait for a free slot and for the next start time
    ///
    /// The returned permit holds the slot until dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        let start_at = {
            let mut next = self.next_start.lock().await;
            let start_at = (*next).max(Instant::now());
            *next = start_at + self.min_interval;
            start_at
        };
        sleep_until(start_at).await;
        Ok(permit)
    }
}

#[cfg(test)]
impl RateLimiter {
    /// Slots not currently held
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
