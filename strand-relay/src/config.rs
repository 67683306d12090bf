//! Configuration loading for strand-relay.
//!
//! The relay reads one TOML file, `relay.toml` unless `--config` says
//! otherwise. Every section and field is optional and falls back to the
//! defaults below.

use serde::Deserialize;
use std::path::PathBuf;
use strand_types::PublicKey;

/// Root configuration for strand-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// `[server]`: listener and identity.
    #[serde(default)]
    pub server: ServerConfig,
    /// `[storage]`: SQLite location.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Access policy.
    #[serde(default)]
    pub access: AccessConfig,
    /// Rate limiting and protocol limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// `[cleanup]`: expiry purge schedule.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket (default: 0.0.0.0:7447).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Public URL of this relay. When set, AUTH responses must name it in a `relay` tag.
    pub relay_url: Option<String>,
    /// Relay name for the information document.
    #[serde(default = "default_name")]
    pub name: String,
    /// Relay description for the information document.
    #[serde(default)]
    pub description: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Access policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Hex public keys of the relay owners.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Require authentication for writes and full reads.
    #[serde(default)]
    pub auth_required: bool,
    /// Allow unauthenticated reads of non-privileged kinds (default: true).
    #[serde(default = "default_public_readable")]
    pub public_readable: bool,
    /// How many follow-list hops from the owners count as followed (default: 2).
    #[serde(default = "default_follow_depth")]
    pub follow_depth: u32,
}

/// Rate limiting and protocol limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum new connections per IP address per minute (default: 10).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum messages per connection per minute (default: 600).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Maximum requests per second across all clients (default: 1000).
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,
    /// Maximum inbound frame size in bytes (default: 512 KiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum live subscriptions per connection (default: 20).
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Upper bound applied to a filter's `limit` (default: 500).
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: u64,
    /// Limit used when a filter has none (default: 100).
    #[serde(default = "default_query_limit")]
    pub default_query_limit: u64,
    /// How far ahead of the relay clock `created_at` may be (default: 900).
    #[serde(default = "default_max_future_secs")]
    pub max_future_secs: u64,
    /// Seconds between keepalive pings (default: 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds without a pong before the connection is dropped (default: 90).
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Maximum clock skew accepted on AUTH events (default: 600).
    #[serde(default = "default_auth_window_secs")]
    pub auth_window_secs: u64,
    /// Envelopes queued per connection before live delivery disconnects
    /// a subscriber that is not reading (default: 1024).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7447".to_string()
}

fn default_name() -> String {
    "strand".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_public_readable() -> bool {
    true
}

fn default_follow_depth() -> u32 {
    2
}

fn default_connections_per_ip() -> u32 {
    10
}

fn default_messages_per_minute() -> u32 {
    600
}

fn default_global_rps() -> u32 {
    1000
}

fn default_max_message_size() -> usize {
    512 * 1024
}

fn default_max_subscriptions() -> usize {
    20
}

fn default_max_query_limit() -> u64 {
    500
}

fn default_query_limit() -> u64 {
    100
}

fn default_max_future_secs() -> u64 {
    15 * 60
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    90
}

fn default_auth_window_secs() -> u64 {
    10 * 60
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            relay_url: None,
            name: default_name(),
            description: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            owners: Vec::new(),
            auth_required: false,
            public_readable: default_public_readable(),
            follow_depth: default_follow_depth(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_rps(),
            max_message_size: default_max_message_size(),
            max_subscriptions: default_max_subscriptions(),
            max_query_limit: default_max_query_limit(),
            default_query_limit: default_query_limit(),
            max_future_secs: default_max_future_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            auth_window_secs: default_auth_window_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Read, parse and validate `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.owner_keys()?;

        let limits = &self.limits;
        let nonzero = [
            ("limits.connections_per_ip", limits.connections_per_ip as u64),
            ("limits.messages_per_minute", limits.messages_per_minute as u64),
            (
                "limits.global_requests_per_second",
                limits.global_requests_per_second as u64,
            ),
            ("limits.max_message_size", limits.max_message_size as u64),
            ("limits.max_query_limit", limits.max_query_limit),
            ("limits.ping_interval_secs", limits.ping_interval_secs),
            ("limits.pong_timeout_secs", limits.pong_timeout_secs),
            ("limits.outbound_queue", limits.outbound_queue as u64),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        if limits.default_query_limit > limits.max_query_limit {
            return Err(ConfigError::Invalid {
                field: "limits.default_query_limit",
                reason: "must not exceed limits.max_query_limit".into(),
            });
        }
        if limits.pong_timeout_secs < limits.ping_interval_secs {
            return Err(ConfigError::Invalid {
                field: "limits.pong_timeout_secs",
                reason: "must be at least limits.ping_interval_secs".into(),
            });
        }
        Ok(())
    }

    /// Parse the configured owner keys.
    pub fn owner_keys(&self) -> Result<Vec<PublicKey>, ConfigError> {
        self.access
            .owners
            .iter()
            .map(|hex| {
                PublicKey::from_hex(hex).map_err(|e| ConfigError::Invalid {
                    field: "access.owners",
                    reason: format!("{hex}: {e}"),
                })
            })
            .collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range or malformed.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
