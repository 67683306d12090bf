//! Error types for strand wire types.

use thiserror::Error;

/// Errors produced while decoding or encoding a wire envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not a JSON array of the expected shape
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// JSON parsing failed
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The first element is not a known label
    #[error("unknown envelope label: {0}")]
    UnknownLabel(String),

    /// The envelope is empty or lacks its label
    #[error("envelope has no label")]
    MissingLabel,

    /// A required positional field is absent
    #[error("{label} envelope is missing field: {field}")]
    MissingField {
        /// Envelope label
        label: &'static str,
        /// Name of the missing field
        field: &'static str,
    },

    /// More fields were supplied than the label allows
    #[error("{label} envelope has trailing data")]
    TrailingData {
        /// Envelope label
        label: &'static str,
    },

    /// A field could not be parsed into its expected type
    #[error("{label} envelope has invalid {field}: {reason}")]
    InvalidField {
        /// Envelope label
        label: &'static str,
        /// Name of the offending field
        field: &'static str,
        /// Parser message
        reason: String,
    },
}

/// Errors that can occur validating or signing an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Hex string had the wrong length or alphabet
    #[error("invalid hex for {what}: {reason}")]
    InvalidHex {
        /// Which field was being decoded
        what: &'static str,
        /// Decoder message
        reason: String,
    },

    /// The id does not match the canonical hash
    #[error("event id is computed incorrectly")]
    IdMismatch,

    /// The signature does not verify against pubkey and id
    #[error("signature is invalid")]
    BadSignature,

    /// The public key is not a valid x-only secp256k1 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The secret key is out of range
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// The OS random source failed
    #[error("entropy source failed: {0}")]
    Entropy(String),

    /// Canonical serialization failed
    #[error("serialization failed: {0}")]
    Serialization(String),
}
