//! Fixed-window per-IP rate limiting.
//!
//! Edge backpressure only; the webhook path relies on the gateway's own
//! retry cadence instead and is never limited.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct Window {
    started_at: Instant,
    hits: u32,
}

/// A fixed-window counter per client IP. Internally synchronized.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit from `ip` and return whether it is within the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter poisoned");

        // Keep the map bounded: drop windows that have rolled over.
        if windows.len() > 10_000 {
            let window = self.window;
            windows.retain(|_, w| now - w.started_at < window);
        }

        let entry = windows.entry(ip).or_insert(Window {
            started_at: now,
            hits: 0,
        });
        if now - entry.started_at >= self.window {
            entry.started_at = now;
            entry.hits = 0;
        }
        entry.hits += 1;
        entry.hits <= self.limit
    }
}
