//! Fixed-window request rate limiter
//!
//! Counts requests per key inside a fixed window. A background task
//! sweeps dead windows at the window interval so abandoned keys do not
//! accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;

/// Outcome of a limiter check for one key.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
    pub limit: u32,
    pub window_ms: u64,
}

struct RateWindow {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// Atomically starts/rolls the window for `key` and counts this request.
    pub fn check(&self, key: &str) -> RateDecision {
        self.decide(key, true)
    }

    /// Same shape as [`check`](Self::check) without counting the request.
    pub fn peek(&self, key: &str) -> RateDecision {
        self.decide(key, false)
    }

    fn decide(&self, key: &str, count_request: bool) -> RateDecision {
        let limit = self.config.max_requests;

        if !self.config.enabled {
            return RateDecision {
                allowed: true,
                remaining: limit,
                retry_after_secs: 0,
                limit,
                window_ms: self.config.window_ms,
            };
        }

        let now = Instant::now();
        let window = self.window();
        let mut windows = self.windows.lock().expect("rate limiter lock");

        let entry = windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_at = entry.window_start + window;
        if entry.count < limit {
            if count_request {
                entry.count += 1;
            }
            RateDecision {
                allowed: true,
                remaining: limit - entry.count,
                retry_after_secs: 0,
                limit,
                window_ms: self.config.window_ms,
            }
        } else {
            let remaining_ms = reset_at.saturating_duration_since(now).as_millis() as u64;
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: remaining_ms.div_ceil(1000),
                limit,
                window_ms: self.config.window_ms,
            }
        }
    }

    pub fn reset(&self, key: &str) {
        self.windows.lock().expect("rate limiter lock").remove(key);
    }

    pub fn reset_all(&self) {
        self.windows.lock().expect("rate limiter lock").clear();
    }

    /// Drops windows whose period has elapsed.
    fn sweep(&self) {
        let now = Instant::now();
        let window = self.window();
        self.windows
            .lock()
            .expect("rate limiter lock")
            .retain(|_, w| now.duration_since(w.window_start) < window);
    }

    /// Sweeps expired windows at the window interval until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.window().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        })
    }
}
