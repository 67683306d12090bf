//! Periodic housekeeping: purge events past their `expiration` tag and
//! drop rate limiter keys that have gone quiet.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::server::unix_now;
use crate::storage::EventStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Start housekeeping on the runtime. Abort the handle to stop it.
pub fn spawn_cleanup_task(
    store: Arc<dyn EventStore>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Expiry cleanup off");
            return;
        }

        tracing::info!("Expiry cleanup every {}s", config.interval_secs);
        let mut ticks = interval(Duration::from_secs(config.interval_secs.max(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            run_once(store.as_ref(), &rate_limits).await;
        }
    })
}

/// One cleanup pass.
pub async fn run_once(store: &dyn EventStore, rate_limits: &RateLimits) {
    match store.delete_expired(unix_now()).await {
        Ok(0) => {}
        Ok(purged) => tracing::info!("Purged {} expired events", purged),
        Err(e) => tracing::error!("Expiry purge failed: {}", e),
    }
    rate_limits.shrink();
    let (ips, connections) = rate_limits.tracked_keys();
    tracing::debug!("Limiter keys after shrink: {} ips, {} connections", ips, connections);
}
