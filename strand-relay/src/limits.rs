//! Rate limiting for strand-relay.
//!
//! Three governor limiters guard the relay:
//! - new WebSocket connections, keyed by client IP
//! - every inbound frame, keyed by connection id
//! - all requests together, unkeyed
//!
//! Keyed state lives in DashMap and is pruned by the cleanup task.

use crate::config::LimitsConfig;
use crate::session::ConnectionId;
use governor::clock::{DefaultClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

type Keyed<K> =
    RateLimiter<K, dashmap::DashMap<K, InMemoryState>, DefaultClock, NoOpMiddleware<QuantaInstant>>;

type Unkeyed = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared handle to the relay's limiters. Clones share state.
#[derive(Clone)]
pub struct RateLimits {
    per_ip: Arc<Keyed<IpAddr>>,
    per_connection: Arc<Keyed<ConnectionId>>,
    global: Arc<Unkeyed>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("tracked_ips", &self.per_ip.len())
            .field("tracked_connections", &self.per_connection.len())
            .finish_non_exhaustive()
    }
}

/// Zero quotas are rejected by `Config::validate`; clamp to one regardless.
fn at_least_one(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Build the limiters from `[limits]`.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            per_ip: Arc::new(RateLimiter::keyed(Quota::per_minute(at_least_one(
                config.connections_per_ip,
            )))),
            per_connection: Arc::new(RateLimiter::keyed(Quota::per_minute(at_least_one(
                config.messages_per_minute,
            )))),
            global: Arc::new(RateLimiter::direct(Quota::per_second(at_least_one(
                config.global_requests_per_second,
            )))),
        }
    }

    /// Admit a WebSocket upgrade from `ip`.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.per_ip
            .check_key(&ip)
            .map_err(|_| RateLimitError::Connections)
    }

    /// Admit one message on `connection`.
    pub fn check_message(&self, connection: ConnectionId) -> Result<(), RateLimitError> {
        self.per_connection
            .check_key(&connection)
            .map_err(|_| RateLimitError::Messages)
    }

    /// Admit one request against the relay-wide budget.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global.check().map_err(|_| RateLimitError::Global)
    }

    /// Global first, then per connection.
    pub fn check_request(&self, connection: ConnectionId) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.check_message(connection)
    }

    /// Number of keys held as `(ips, connections)`.
    pub fn tracked_keys(&self) -> (usize, usize) {
        (self.per_ip.len(), self.per_connection.len())
    }

    /// Evict entries whose quota has fully recharged.
    ///
    /// Closed connections and idle IPs otherwise accumulate in the maps.
    pub fn shrink(&self) {
        self.per_ip.retain_recent();
        self.per_connection.retain_recent();
    }
}

/// Which budget a request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from one address.
    #[error("too many connections from this address")]
    Connections,
    /// Too many messages on one connection.
    #[error("too many messages on this connection")]
    Messages,
    /// The relay as a whole is saturated.
    #[error("relay is busy, slow down")]
    Global,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_ip: u32, per_connection: u32, global: u32) -> RateLimits {
        RateLimits::new(&LimitsConfig {
            connections_per_ip: per_ip,
            messages_per_minute: per_connection,
            global_requests_per_second: global,
            ..LimitsConfig::default()
        })
    }

    #[test]
    fn starts_without_keys() {
        assert_eq!(RateLimits::new(&LimitsConfig::default()).tracked_keys(), (0, 0));
    }

    #[test]
    fn ip_quota_is_enforced() {
        let limits = limits(3, 100, 1000);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!((0..3).all(|_| limits.check_connection(ip).is_ok()));
        assert_eq!(limits.check_connection(ip), Err(RateLimitError::Connections));
        // Another address has its own budget
        assert!(limits.check_connection("10.0.0.2".parse().unwrap()).is_ok());
    }

    #[test]
    fn connection_quota_is_per_connection() {
        let limits = limits(100, 2, 1000);

        for connection in [1, 2] {
            assert!(limits.check_request(connection).is_ok());
            assert!(limits.check_request(connection).is_ok());
            assert_eq!(
                limits.check_request(connection),
                Err(RateLimitError::Messages)
            );
        }
        assert_eq!(limits.tracked_keys(), (0, 2));
    }

    #[test]
    fn global_budget_is_checked_first() {
        let limits = limits(100, 100, 4);

        for connection in 0..4 {
            assert!(limits.check_request(connection).is_ok());
        }
        assert_eq!(limits.check_request(99), Err(RateLimitError::Global));
        // The rejected request never reached the per-connection limiter
        assert_eq!(limits.tracked_keys().1, 4);
    }

    #[test]
    fn zero_quotas_allow_one() {
        let limits = limits(0, 0, 0);
        assert!(limits.check_global().is_ok());
        assert!(limits.check_global().is_err());
    }

    #[test]
    fn clones_share_state() {
        let a = limits(100, 1, 1000);
        let b = a.clone();
        assert!(a.check_message(5).is_ok());
        assert!(b.check_message(5).is_err());
    }

    #[test]
    fn shrink_keeps_recently_used_keys() {
        let limits = limits(1, 1, 1000);
        limits.check_connection("10.0.0.1".parse().unwrap()).unwrap();
        limits.check_message(1).unwrap();

        limits.shrink();
        // Quotas of one per minute have not recharged yet
        assert_eq!(limits.tracked_keys(), (1, 1));
    }

    #[test]
    fn errors_read_as_reasons() {
        assert_eq!(
            RateLimitError::Messages.to_string(),
            "too many messages on this connection"
        );
        assert_eq!(RateLimitError::Global.to_string(), "relay is busy, slow down");
    }
}
