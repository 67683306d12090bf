//! Identity types for strand events.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::EventError;

/// Fixed-size byte identifiers that travel as lowercase hex on the wire.
macro_rules! hex_identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Length of the raw identifier in bytes.
            pub const LEN: usize = $len;

            /// Wrap raw bytes.
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Create from a byte slice of the exact length.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                <[u8; $len]>::try_from(bytes).ok().map(Self)
            }

            /// Parse from a lowercase hex string.
            ///
            /// Uppercase digits are refused so that the wire form always
            /// re-encodes to the same bytes.
            pub fn from_hex(s: &str) -> Result<Self, EventError> {
                if s.bytes().any(|b| b.is_ascii_uppercase()) {
                    return Err(EventError::InvalidHex {
                        what: $what,
                        reason: "hex must be lowercase".to_string(),
                    });
                }
                let raw = hex::decode(s).map_err(|e| EventError::InvalidHex {
                    what: $what,
                    reason: e.to_string(),
                })?;
                Self::from_bytes(&raw).ok_or_else(|| EventError::InvalidHex {
                    what: $what,
                    reason: format!("expected {} bytes, got {}", $len, raw.len()),
                })
            }

            /// Get the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Encode as lowercase hex.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }
    };
}

hex_identifier!(
    /// Content hash of an event (SHA-256 of its canonical serialization).
    EventId,
    32,
    "event id"
);

hex_identifier!(
    /// An x-only secp256k1 public key identifying an author.
    PublicKey,
    32,
    "public key"
);

hex_identifier!(
    /// A BIP-340 Schnorr signature over an event id.
    Signature,
    64,
    "signature"
);

/// Maximum length of a client-chosen subscription id.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Client-chosen subscription name, unique only within one connection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Create a subscription id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Check the id is non-empty and within the length cap.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.chars().count() <= MAX_SUBSCRIPTION_ID_LEN
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_hex_roundtrip() {
        let id = EventId::new([0xab; 32]);
        let restored = EventId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn public_key_from_invalid_length_fails() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_bytes(&[0u8; 16]).is_none());
        assert!(PublicKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn uppercase_hex_is_refused() {
        let lower = "ab".repeat(32);
        assert!(EventId::from_hex(&lower).is_ok());
        assert!(EventId::from_hex(&lower.to_uppercase()).is_err());
        assert!(PublicKey::from_hex(&format!("A{}", &lower[1..])).is_err());
        let quoted = format!("\"{}\"", lower.to_uppercase());
        assert!(serde_json::from_str::<EventId>(&quoted).is_err());
    }

    #[test]
    fn signature_is_64_bytes() {
        let sig = Signature::new([1u8; 64]);
        assert_eq!(sig.to_hex().len(), 128);
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        let id = EventId::new([0x01; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn event_id_order_matches_hex_order() {
        let low = EventId::new([0x0f; 32]);
        let high = EventId::new([0xf0; 32]);
        assert!(low < high);
        assert!(low.to_hex() < high.to_hex());
    }

    #[test]
    fn subscription_id_validation() {
        assert!(SubscriptionId::new("sub").is_valid());
        assert!(!SubscriptionId::new("").is_valid());
        assert!(!SubscriptionId::new("x".repeat(65)).is_valid());
        assert!(SubscriptionId::new("x".repeat(64)).is_valid());
    }

    #[test]
    fn debug_is_abbreviated() {
        let pk = PublicKey::new([0xcd; 32]);
        assert_eq!(format!("{:?}", pk), "PublicKey(cdcdcdcd)");
    }
}
