//! HTTP endpoints for strand-relay.
//!
//! `/` upgrades WebSocket requests into relay sessions and otherwise serves
//! the relay information document. `/health` and `/metrics` are for
//! operators.

pub mod health;
mod info;
mod metrics;

use crate::error::RelayError;
use crate::server::Relay;
use crate::session;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ConnectInfo;
use axum::http::{header::ACCEPT, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Extension, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use health::HealthStatus;
pub use info::RelayInformation;

/// Media type clients use to ask for the information document.
pub const NOSTR_JSON: &str = "application/nostr+json";

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<Relay>) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health::health_handler));
    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve(
    relay: Arc<Relay>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), RelayError> {
    let app = build_router(relay);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn root_handler(
    Extension(relay): Extension<Arc<Relay>>,
    ws: Option<WebSocketUpgrade>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let remote = connect_info
        .map(|ConnectInfo(addr)| addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    if let Some(ws) = ws {
        if let Err(e) = relay.rate_limits().check_connection(remote.ip()) {
            tracing::warn!("Connection rate limited for {}: {}", remote, e);
            relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
        }
        let max = relay.config().limits.max_message_size;
        return ws
            .max_message_size(max)
            .on_upgrade(move |socket| session::run(relay, socket, remote))
            .into_response();
    }

    let wants_info = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(NOSTR_JSON));
    if wants_info {
        return info::info_response(&relay);
    }

    let name = relay.config().server.name.clone();
    format!("{name}: connect with a WebSocket client").into_response()
}
