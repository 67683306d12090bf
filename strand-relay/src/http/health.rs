//! `/health` liveness endpoint.

use crate::server::Relay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static STARTED: OnceLock<Instant> = OnceLock::new();

/// Record process start. Later calls are no-ops.
pub fn init_start_time() {
    STARTED.get_or_init(Instant::now);
}

fn uptime_seconds() -> u64 {
    STARTED.get().map_or(0, |t| t.elapsed().as_secs())
}

/// Body of `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub subscriptions: usize,
    /// True when the relay only accepts writes from the owners' network.
    pub restricted: bool,
    pub uptime_seconds: u64,
}

impl HealthStatus {
    async fn sample(relay: &Relay) -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            connections: relay.broker().connection_count().await,
            subscriptions: relay.broker().subscription_count().await,
            restricted: relay.access().is_restricted(),
            uptime_seconds: uptime_seconds(),
        }
    }
}

pub async fn health_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<HealthStatus> {
    Json(HealthStatus::sample(&relay).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStore;

    #[tokio::test]
    async fn idle_relay_reports_no_traffic() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let relay = Relay::new(Config::default(), store).unwrap();

        let value = serde_json::to_value(HealthStatus::sample(&relay).await).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["connections"], 0);
        assert_eq!(value["subscriptions"], 0);
        assert_eq!(value["restricted"], false);
    }
}
