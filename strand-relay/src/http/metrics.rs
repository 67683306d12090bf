//! Prometheus metrics endpoint.

use crate::server::{Relay, RelayMetrics};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Point-in-time values sampled per scrape.
#[derive(Debug, Default, Clone, Copy)]
struct Gauges {
    connections: usize,
    subscriptions: usize,
    limiter_ips: usize,
    limiter_connections: usize,
}

/// Serves counters and gauges in Prometheus text format.
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    let (limiter_ips, limiter_connections) = relay.rate_limits().tracked_keys();
    let gauges = Gauges {
        connections: relay.broker().connection_count().await,
        subscriptions: relay.broker().subscription_count().await,
        limiter_ips,
        limiter_connections,
    };
    let body = render(relay.metrics(), gauges);

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn render(m: &RelayMetrics, gauges: Gauges) -> String {
    let Gauges {
        connections,
        subscriptions,
        limiter_ips,
        limiter_connections,
    } = gauges;
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let received = m.events_received.load(Ordering::Relaxed);
    let stored = m.events_stored.load(Ordering::Relaxed);
    let rejected = m.events_rejected.load(Ordering::Relaxed);
    let deliveries = m.deliveries_total.load(Ordering::Relaxed);
    let subs_total = m.subscriptions_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    format!(
        r#"# HELP strand_relay_connections_active Number of open connections
# TYPE strand_relay_connections_active gauge
strand_relay_connections_active {connections}

# HELP strand_relay_subscriptions_active Number of live subscriptions
# TYPE strand_relay_subscriptions_active gauge
strand_relay_subscriptions_active {subscriptions}

# HELP strand_relay_limiter_keys Keys held by the rate limiters
# TYPE strand_relay_limiter_keys gauge
strand_relay_limiter_keys{{limiter="ip"}} {limiter_ips}
strand_relay_limiter_keys{{limiter="connection"}} {limiter_connections}

# HELP strand_relay_info Server information
# TYPE strand_relay_info gauge
strand_relay_info{{version="{version}"}} 1

# HELP strand_relay_connections_total Total connections accepted
# TYPE strand_relay_connections_total counter
strand_relay_connections_total {conns_total}

# HELP strand_relay_events_received_total Total EVENT submissions
# TYPE strand_relay_events_received_total counter
strand_relay_events_received_total {received}

# HELP strand_relay_events_stored_total Total events accepted
# TYPE strand_relay_events_stored_total counter
strand_relay_events_stored_total {stored}

# HELP strand_relay_events_rejected_total Total events rejected
# TYPE strand_relay_events_rejected_total counter
strand_relay_events_rejected_total {rejected}

# HELP strand_relay_deliveries_total Total events queued to subscribers
# TYPE strand_relay_deliveries_total counter
strand_relay_deliveries_total {deliveries}

# HELP strand_relay_subscriptions_total Total subscriptions opened
# TYPE strand_relay_subscriptions_total counter
strand_relay_subscriptions_total {subs_total}

# HELP strand_relay_rate_limit_hits_total Total rate limit rejections
# TYPE strand_relay_rate_limit_hits_total counter
strand_relay_rate_limit_hits_total {rate_limits}

# HELP strand_relay_errors_total Total protocol and storage errors
# TYPE strand_relay_errors_total counter
strand_relay_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
