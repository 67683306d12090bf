//! Relay information document.

use super::NOSTR_JSON;
use crate::server::Relay;
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Protocol extensions this relay implements.
pub const SUPPORTED_NIPS: &[u16] = &[1, 9, 11, 40, 42, 45];

/// Self-description served to clients that ask for it.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInformation {
    /// Relay name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// First owner key, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    /// Implemented protocol extensions.
    pub supported_nips: Vec<u16>,
    /// Implementation name.
    pub software: String,
    /// Implementation version.
    pub version: String,
    /// Limits clients should respect.
    pub limitation: Limitation,
}

/// Advertised limits.
#[derive(Debug, Clone, Serialize)]
pub struct Limitation {
    /// Maximum frame size in bytes.
    pub max_message_length: usize,
    /// Maximum live subscriptions per connection.
    pub max_subscriptions: usize,
    /// Upper bound on a filter's limit.
    pub max_limit: u64,
    /// Limit used when a filter has none.
    pub default_limit: u64,
    /// Whether any operation needs AUTH.
    pub auth_required: bool,
    /// Whether writes are limited to the owners' network.
    pub restricted_writes: bool,
}

impl RelayInformation {
    /// Describe `relay` from its configuration.
    pub fn from_relay(relay: &Relay) -> Self {
        let config = relay.config();
        Self {
            name: config.server.name.clone(),
            description: config.server.description.clone(),
            pubkey: config.access.owners.first().cloned(),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            limitation: Limitation {
                max_message_length: config.limits.max_message_size,
                max_subscriptions: config.limits.max_subscriptions,
                max_limit: config.limits.max_query_limit,
                default_limit: config.limits.default_query_limit,
                auth_required: config.access.auth_required,
                restricted_writes: relay.access().is_restricted(),
            },
        }
    }
}

pub(super) fn info_response(relay: &Relay) -> Response {
    let body = match serde_json::to_string(&RelayInformation::from_relay(relay)) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("Failed to encode relay information: {}", e);
            return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    (
        [(CONTENT_TYPE, NOSTR_JSON), (ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        body,
    )
        .into_response()
}
