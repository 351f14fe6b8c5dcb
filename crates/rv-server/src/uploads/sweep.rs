//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;

/// Run [`SessionRegistry::sweep_expired`] every `interval` until cancelled.
///
/// The first sweep runs immediately, which reclaims scratch directories left
/// behind by a previous process.
pub async fn run_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("Upload sweeper started (every {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        match registry.sweep_expired(Utc::now()).await {
            Ok(report) if report == Default::default() => {}
            Ok(report) => tracing::info!(
                expired = report.expired,
                orphans_removed = report.orphans_removed,
                tombstones_purged = report.tombstones_purged,
                "Upload sweep finished"
            ),
            Err(e) => tracing::error!("Upload sweep failed: {e}"),
        }
    }

    tracing::info!("Upload sweeper stopped");
}
