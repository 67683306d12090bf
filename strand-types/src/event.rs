//! Signed, immutable event records.

use secp256k1::{schnorr, Keypair, Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::{EventError, EventId, Kind, PublicKey, Signature, Tag};

/// Shared verification context; building one is comparatively expensive.
static VERIFIER: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

/// An immutable record published to the relay.
///
/// ```json
/// {
///   "id": "4376c65d...",
///   "pubkey": "6e468422...",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["p", "6e468422..."]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// SHA-256 of the canonical serialization.
    pub id: EventId,
    /// Author's x-only public key.
    pub pubkey: PublicKey,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Class selector.
    pub kind: Kind,
    /// Ordered tag rows.
    pub tags: Vec<Tag>,
    /// Arbitrary content.
    pub content: String,
    /// Schnorr signature over `id`.
    pub sig: Signature,
}

impl Event {
    /// Recompute the canonical id from the other fields.
    pub fn compute_id(&self) -> Result<EventId, EventError> {
        canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Check that `id` equals the canonical hash.
    pub fn check_id(&self) -> Result<(), EventError> {
        if self.compute_id()? == self.id {
            Ok(())
        } else {
            Err(EventError::IdMismatch)
        }
    }

    /// Check the signature against `pubkey` and `id`.
    pub fn check_signature(&self) -> Result<(), EventError> {
        let secp = VERIFIER.get_or_init(Secp256k1::verification_only);
        let pk = XOnlyPublicKey::from_slice(self.pubkey.as_bytes())
            .map_err(|_| EventError::InvalidPublicKey)?;
        let sig = schnorr::Signature::from_slice(self.sig.as_bytes())
            .map_err(|_| EventError::BadSignature)?;
        let msg = Message::from_digest(*self.id.as_bytes());
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| EventError::BadSignature)
    }

    /// Full integrity check: id first, then signature.
    pub fn verify(&self) -> Result<(), EventError> {
        self.check_id()?;
        self.check_signature()
    }

    /// Values of every tag row named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.is(name))
            .filter_map(Tag::value)
    }

    /// First `d` tag value, or the empty string when absent.
    pub fn identifier(&self) -> &str {
        self.tag_values("d").next().unwrap_or_default()
    }

    /// Whether a `p` tag names `pubkey`.
    pub fn mentions(&self, pubkey: &PublicKey) -> bool {
        let hex = pubkey.to_hex();
        self.tag_values("p").any(|v| v.eq_ignore_ascii_case(&hex))
    }

    /// NIP-40 expiration timestamp, if any.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_values("expiration")
            .next()
            .and_then(|v| v.parse().ok())
    }

    /// Whether the event carries an expiration at or before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration().is_some_and(|exp| exp <= now)
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> String {
        // Every field is a string, integer or array of strings
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An event that has not been hashed or signed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Class selector.
    pub kind: Kind,
    /// Ordered tag rows.
    pub tags: Vec<Tag>,
    /// Arbitrary content.
    pub content: String,
}

impl UnsignedEvent {
    /// Start an event of `kind` with the given content.
    pub fn new(kind: Kind, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag row.
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(Tag::new(parts));
        self
    }
}

/// A secp256k1 keypair able to sign events.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public: PublicKey,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Keys {
    /// Create keys from a 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, EventError> {
        let secp = Secp256k1::signing_only();
        let keypair =
            Keypair::from_seckey_slice(&secp, secret).map_err(|_| EventError::InvalidSecretKey)?;
        let (xonly, _) = keypair.x_only_public_key();
        Ok(Self {
            keypair,
            public: PublicKey::new(xonly.serialize()),
        })
    }

    /// Generate fresh random keys.
    pub fn generate() -> Result<Self, EventError> {
        loop {
            let mut secret = [0u8; 32];
            getrandom::getrandom(&mut secret).map_err(|e| EventError::Entropy(e.to_string()))?;
            if let Ok(keys) = Self::from_secret_bytes(&secret) {
                return Ok(keys);
            }
        }
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Hash and sign an event.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, EventError> {
        let id = canonical_hash(
            &self.public,
            unsigned.created_at,
            unsigned.kind,
            &unsigned.tags,
            &unsigned.content,
        )?;
        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest(*id.as_bytes());
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id,
            pubkey: self.public,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: Signature::new(sig.serialize()),
        })
    }
}

/// SHA-256 over `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
fn canonical_hash(
    pubkey: &PublicKey,
    created_at: u64,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> Result<EventId, EventError> {
    let data = serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content))
        .map_err(|e| EventError::Serialization(e.to_string()))?;
    Ok(EventId::new(Sha256::digest(&data).into()))
}
