use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

/// Bounds in-flight requests and spaces request starts per host.
///
/// Each `Fetcher` owns its own limiter, two fetchers never share slots.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    interval: Duration,
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

/// Held for the duration of one request.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(max_in_flight: usize, interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            interval,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for a free in-flight slot, then for the host's next start slot.
    pub async fn acquire(&self, host: &str) -> Result<Permit, AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        let start = self.reserve(host);
        sleep_until(start).await;
        Ok(Permit { _permit: permit })
    }

    fn reserve(&self, host: &str) -> Instant {
        let now = Instant::now();
        let mut slots = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(host.to_string()).or_insert(now);
        let start = (*slot).max(now);
        *slot = start + self.interval;
        start
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
