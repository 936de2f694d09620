//! Per-host request spacing.
//!
//! Lanes that hit the same host take consecutive time slots at least
//! `interval` apart. Different hosts never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use harvest_core::error::AppError;
use harvest_core::traits::Fetcher;
use url::Url;

/// A [`Fetcher`] wrapper that spaces requests to the same host.
#[derive(Clone)]
pub struct HostThrottle<F> {
    inner: F,
    interval: Duration,
    /// Earliest instant the next request to each host may start.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<F: Fetcher> HostThrottle<F> {
    pub fn new(inner: F, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn host_key(url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        parsed.host_str().map(|h| h.trim_start_matches("www.").to_lowercase())
    }

    /// Claim the next slot for `host` and return how long to wait for it.
    fn reserve(&self, host: String) -> Duration {
        let now = Instant::now();
        let mut slots = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = slots.get(&host).copied().unwrap_or(now).max(now);
        slots.insert(host, slot + self.interval);
        slot - now
    }
}

impl<F: Fetcher> Fetcher for HostThrottle<F> {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if !self.interval.is_zero()
            && let Some(host) = Self::host_key(url)
        {
            let wait = self.reserve(host);
            if !wait.is_zero() {
                tracing::debug!(url, wait_ms = wait.as_millis() as u64, "Throttling request");
                tokio::time::sleep(wait).await;
            }
        }
        self.inner.fetch(url).await
    }
}
