//! Error types for strand-relay.

/// Main error type for strand-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An event with this id is already stored.
    #[error("event already stored")]
    Duplicate,

    /// The id was deleted with a tombstone and may not be stored again.
    #[error("event was deleted")]
    Tombstoned,

    /// A stored event could not be decoded.
    #[error("stored event is corrupt: {0}")]
    Codec(#[from] serde_json::Error),

    /// Backend cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("invalid message: {0}")]
    Envelope(#[from] strand_types::EnvelopeError),

    /// Frame exceeds the configured maximum.
    #[error("message too large: {size} > {limit}")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    Transport(#[from] axum::Error),

    /// Peer stopped answering pings.
    #[error("no pong received within {0}s")]
    PongTimeout(u64),

    /// The OS random source failed while creating a challenge.
    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// Reasons a publish did not store the event.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// A replaceable event with a newer timestamp already exists.
    #[error("not replacing newer event")]
    NewerExists,

    /// The id carries a tombstone.
    #[error("event was deleted, not storing it again")]
    Tombstoned,

    /// The event's expiration has passed.
    #[error("event has expired")]
    Expired,

    /// The store rejected the write.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}
