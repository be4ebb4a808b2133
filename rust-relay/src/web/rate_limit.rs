//! Sliding-window rate limiting per source address.
//!
//! Each source keeps the instants of its recent requests. On every check the
//! list is pruned to the trailing window, so there are no fixed buckets to
//! reset. State is process-local; several relay instances each keep their own
//! table.
//!
//! Source keys come from client-supplied headers, so idle sources are swept
//! out of the table every [`SWEEP_EVERY`] checks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Number of checks between sweeps of idle sources.
pub const SWEEP_EVERY: usize = 256;

/// Source key shared by every request without a usable address header.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Time source for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sliding-window limiter keyed by source address.
pub struct RateLimiter {
    windows: DashMap<String, Vec<Instant>>,
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    checks: AtomicUsize,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
            clock,
            checks: AtomicUsize::new(0),
        }
    }

    /// Record a request from `source` unless it is over the limit.
    ///
    /// Returns `true` when the request must be rejected. Rejected requests
    /// are not recorded.
    pub fn is_limited(&self, source: &str) -> bool {
        let now = self.clock.now();
        let window_start = now.checked_sub(self.window);

        let limited = {
            let mut history = self.windows.entry(source.to_string()).or_default();
            if let Some(start) = window_start {
                history.retain(|&t| t > start);
            }

            if history.len() >= self.limit {
                warn!(
                    source = %source,
                    requests_in_window = history.len(),
                    limit = self.limit,
                    "rate_limit_exceeded"
                );
                true
            } else {
                history.push(now);
                false
            }
        };

        // The entry guard above must be dropped before sweeping.
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle();
        }

        limited
    }

    /// Drop sources with no requests inside the current window.
    ///
    /// Returns the number of sources removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let window_start = now.checked_sub(self.window);
        let before = self.windows.len();

        self.windows.retain(|_, history| match window_start {
            Some(start) => history.iter().any(|&t| t > start),
            None => !history.is_empty(),
        });

        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "rate_limit_sources_evicted");
        }
        removed
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        self.windows.len()
    }
}

/// Best available client address: `CF-Connecting-IP`, then the first
/// `X-Forwarded-For` entry, then [`UNKNOWN_SOURCE`].
pub fn source_key(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("cf-connecting-ip")
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .unwrap_or(UNKNOWN_SOURCE)
        .to_string()
}
