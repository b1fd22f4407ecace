use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

use crate::config::clamp_requests_per_minute;

const MINUTE_MS: u64 = 60_000;

/// Minimum spacing between calls to one external source. No bursts.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(max_requests: u32) -> Self {
        let safe = u64::from(clamp_requests_per_minute(max_requests));
        Self {
            min_interval: Duration::from_millis(MINUTE_MS.div_ceil(safe)),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until the interval since the previous call has elapsed. Callers
    /// on other limiters are never blocked.
    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
