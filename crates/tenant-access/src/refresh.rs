//! Proactive background token refresh
//!
//! Periodically refreshes installations that are about to enter the refresh
//! buffer through [`TokenLifecycleManager::refresh_if_expiring_within`], so
//! most requests never pay refresh latency. The request path and this task share
//! the same per-installation lease, so they never refresh the same
//! installation twice.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::lifecycle::TokenLifecycleManager;

/// Spawn the periodic refresh sweep.
///
/// Each tick refreshes installations that will be inside the buffer before the
/// next tick. Failures are logged and retried on the next tick; revoked
/// installations are never listed.
pub fn spawn_refresh_task(
    manager: Arc<TokenLifecycleManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&manager, interval).await;
        }
    })
}

/// Outcome counts of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub failed: usize,
}

/// Run one sweep over installations expiring within the buffer plus
/// `lookahead`.
pub async fn refresh_cycle(manager: &TokenLifecycleManager, lookahead: Duration) -> SweepReport {
    let ids = match manager.expiring_installations(lookahead).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "failed to list expiring installations");
            return SweepReport::default();
        }
    };

    let horizon = manager.refresh_buffer().saturating_add(lookahead);
    let mut report = SweepReport::default();
    for installation_id in &ids {
        report.checked += 1;
        debug!(installation_id, "background refresh");
        if let Err(e) = manager
            .refresh_if_expiring_within(installation_id, horizon)
            .await
        {
            report.failed += 1;
            warn!(installation_id, error = %e, "background refresh failed, will retry next cycle");
        }
    }
    if report.checked > 0 {
        info!(
            checked = report.checked,
            failed = report.failed,
            "background refresh sweep complete"
        );
    }
    report
}
