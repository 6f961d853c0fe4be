//! Background refresh record cleanup task.
//!
//! Periodically purges expired records and tombstones from the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::RefreshTokenStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Run one cleanup pass and log the outcome.
pub fn sweep_once(store: &dyn RefreshTokenStore) -> usize {
    let evicted = match store.evict_expired() {
        Ok(count) => {
            if count > 0 {
                info!(evicted = count, "Refresh token cleanup completed");
            } else {
                debug!("Refresh token cleanup: nothing expired");
            }
            count
        }
        Err(e) => {
            warn!(error = %e, "Refresh token cleanup failed");
            0
        }
    };

    match store.active_count() {
        Ok(count) => {
            debug!(active_refresh_tokens = count, "Refresh token store status");
        }
        Err(e) => {
            debug!(error = %e, "Failed to count refresh tokens");
        }
    }

    evicted
}

/// Spawn a background task that periodically purges expired records.
///
/// Returns a `JoinHandle` that can be used to abort the task. An interval of
/// zero is treated as one second.
pub fn spawn_cleanup_task(
    store: Arc<dyn RefreshTokenStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_once(store.as_ref());
        }
    })
}
