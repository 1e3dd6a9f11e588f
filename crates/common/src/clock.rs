//! Wall-clock helpers
//!
//! Persisted timestamps (token expiry, key usage, audit columns) are unix
//! milliseconds. In-memory windows use `tokio::time::Instant` instead so they
//! can be driven by a paused clock in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
