//! Subscription filters and the match engine.
//!
//! A [`Filter`] is a conjunction of optional constraints; a [`FilterSet`]
//! is a disjunction of filters. Matching is pure and stateless.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Event, EventId, Kind, PublicKey};

/// Declarative match criteria.
///
/// Absent constraints impose no restriction, and so does an empty list.
/// Tag constraints are keyed by a single-letter tag name and match when the
/// event has a row starting with that letter whose second element is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Allowed event ids
    pub ids: Option<Vec<EventId>>,
    /// Allowed authors
    pub authors: Option<Vec<PublicKey>>,
    /// Allowed kinds
    pub kinds: Option<Vec<Kind>>,
    /// Tag constraints (`#e`, `#p`, ...), ordered by tag letter
    pub tags: BTreeMap<char, Vec<String>>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`
    pub until: Option<u64>,
    /// Maximum events returned by a one-shot query
    pub limit: Option<u64>,
}

impl Filter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids.
    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to the given authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Add a tag constraint.
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(letter)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the inclusive lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the inclusive upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the one-shot result limit.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Values constrained for tag `letter`, if any.
    pub fn tag_values(&self, letter: char) -> Option<&[String]> {
        self.tags.get(&letter).map(Vec::as_slice)
    }

    /// Kinds explicitly requested, empty when unconstrained.
    pub fn requested_kinds(&self) -> &[Kind] {
        self.kinds.as_deref().unwrap_or_default()
    }

    /// Decide whether `event` satisfies every present constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if !allows(&self.ids, &event.id)
            || !allows(&self.authors, &event.pubkey)
            || !allows(&self.kinds, &event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(letter, values)| {
            if values.is_empty() {
                return true;
            }
            let mut name = [0u8; 4];
            let name = letter.encode_utf8(&mut name);
            let matched = event
                .tag_values(name)
                .any(|v| values.iter().any(|allowed| allowed == v));
            matched
        })
    }
}

/// Membership check where `None` or an empty list allows everything.
fn allows<T: PartialEq>(set: &Option<Vec<T>>, value: &T) -> bool {
    match set {
        Some(items) if !items.is_empty() => items.contains(value),
        _ => true,
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FilterVisitor)
    }
}

struct FilterVisitor;

impl<'de> Visitor<'de> for FilterVisitor {
    type Value = Filter;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a filter object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Filter, A::Error> {
        let mut filter = Filter::default();
        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "ids" => filter.ids = Some(access.next_value()?),
                "authors" => filter.authors = Some(access.next_value()?),
                "kinds" => filter.kinds = Some(access.next_value()?),
                "since" => filter.since = Some(access.next_value()?),
                "until" => filter.until = Some(access.next_value()?),
                "limit" => filter.limit = Some(access.next_value()?),
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next(), chars.next()) {
                        (Some('#'), Some(letter), None) if letter.is_ascii_alphabetic() => {
                            let values: Vec<String> = access.next_value()?;
                            if filter.tags.insert(letter, values).is_some() {
                                return Err(de::Error::custom(format!("duplicate field {other}")));
                            }
                        }
                        _ => {
                            access.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
            }
        }
        Ok(filter)
    }
}

/// An ordered sequence of filters; matches when any member matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(pub Vec<Filter>);

impl FilterSet {
    /// Wrap a list of filters.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// Logical OR over member filters.
    pub fn matches(&self, event: &Event) -> bool {
        self.0.iter().any(|f| f.matches(event))
    }

    /// Whether the set has no filters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of member filters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate member filters.
    pub fn iter(&self) -> std::slice::Iter<'_, Filter> {
        self.0.iter()
    }
}

impl From<Vec<Filter>> for FilterSet {
    fn from(filters: Vec<Filter>) -> Self {
        Self(filters)
    }
}

impl<'a> IntoIterator for &'a FilterSet {
    type Item = &'a Filter;
    type IntoIter = std::slice::Iter<'a, Filter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Sort query results newest first, breaking ties by ascending id.
pub fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
