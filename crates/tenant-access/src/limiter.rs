//! Per-tenant fixed-window rate limiting
//!
//! A window opens on a tenant's first request and lasts `window`; every
//! request in it increments the counter and requests beyond `max_requests`
//! are denied until the window elapses. Bursts straddling a boundary can reach
//! twice the limit, which is accepted.
//!
//! Windows live in memory and reset on restart.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    /// `retry_after` is the time left until the current window resets.
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Request counting seam. The in-process limiter is the default; a shared
/// store implementation can be swapped in for multi-instance deployments.
pub trait RateLimiter: Send + Sync {
    fn check_and_increment<'a>(
        &'a self,
        tenant_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RateDecision> + Send + 'a>>;
}

struct RateWindow {
    count: u64,
    reset_at: Instant,
}

pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u64,
    windows: DashMap<String, RateWindow>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `tenant_id`. The map entry is locked for the
    /// read-modify-write so concurrent requests never lose an increment.
    pub fn check(&self, tenant_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(tenant_id.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.window;
        }
        entry.count += 1;

        if entry.count > self.max_requests {
            RateDecision::Denied {
                retry_after: entry.reset_at - now,
            }
        } else {
            RateDecision::Allowed {
                remaining: self.max_requests - entry.count,
            }
        }
    }

    /// Drop windows that have already elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| now < w.reset_at);
        before - self.windows.len()
    }

    /// Number of tenants with a tracked window.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check_and_increment<'a>(
        &'a self,
        tenant_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RateDecision> + Send + 'a>> {
        Box::pin(async move { self.check(tenant_id) })
    }
}

/// Whole seconds to wait, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let secs = if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    };
    secs.max(1)
}
