//! Background job: sweep stale progress trackers.
//!
//! Runs every minute. Trackers older than the TTL belong to searches
//! whose SSE consumers are long gone; dropping them closes the queue
//! and frees the slot in the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::progress::ProgressRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the sweeper. Call once at startup.
pub fn spawn(registry: Arc<ProgressRegistry>) {
    tokio::spawn(async move {
        let mut interval = time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = registry.sweep_stale();
            if removed > 0 {
                tracing::debug!(removed = removed, "progress tracker sweep");
            }
        }
    });
}
