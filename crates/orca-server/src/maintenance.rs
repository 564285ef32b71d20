//! Periodic store maintenance.
//!
//! Expired entries are already invisible to readers; the purge sweeper only
//! reclaims their storage.

use orca_core::SessionStore;
use orca_core::drain::Lifecycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Spawn the purge sweeper. It stops once shutdown is requested.
pub fn spawn_purge_task(
    store: Arc<SessionStore>,
    period: Duration,
    lifecycle: Arc<Lifecycle>,
) -> JoinHandle<()> {
    info!(interval_secs = period.as_secs(), "Starting purge sweeper");

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = lifecycle.shutdown_requested() => {
                    debug!("Purge sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.purge_expired().await {
                        warn!(error = %e, "Purge of expired entries failed");
                    }
                }
            }
        }
    })
}
