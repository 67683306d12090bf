//! Tag rows attached to events.

use serde::{Deserialize, Serialize};

use crate::{EventId, Kind, PublicKey};

/// An ordered row of strings whose first element is the tag name.
///
/// Common rows:
/// - `["e", <event id>]` references another event
/// - `["p", <pubkey>]` references an author
/// - `["a", "<kind>:<pubkey>:<d>"]` references a replaceable coordinate
/// - `["d", <identifier>]` names a parameterized-replaceable slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from any string-like parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Tag value (second element).
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Whether this row is named `name` and has a value.
    pub fn is(&self, name: &str) -> bool {
        self.name() == Some(name) && self.0.len() >= 2
    }

    /// Parse an `e` row as an event id.
    pub fn event_ref(&self) -> Option<EventId> {
        if !self.is("e") {
            return None;
        }
        self.value().and_then(|v| EventId::from_hex(v).ok())
    }

    /// Parse a `p` row as a public key.
    pub fn pubkey_ref(&self) -> Option<PublicKey> {
        if !self.is("p") {
            return None;
        }
        self.value().and_then(|v| PublicKey::from_hex(v).ok())
    }

    /// Parse an `a` row as a `(kind, author, d)` coordinate.
    pub fn coordinate_ref(&self) -> Option<(Kind, PublicKey, String)> {
        if !self.is("a") {
            return None;
        }
        let mut parts = self.value()?.splitn(3, ':');
        let kind = parts.next()?.parse::<u16>().ok()?;
        let author = PublicKey::from_hex(parts.next()?).ok()?;
        let d = parts.next().unwrap_or_default().to_string();
        Some((Kind(kind), author, d))
    }
}
