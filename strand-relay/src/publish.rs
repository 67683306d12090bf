//! Storage semantics: how each kind class turns into store operations.
//!
//! - ephemeral kinds are never stored
//! - replaceable kinds keep one event per author and kind
//! - parameterized-replaceable kinds keep one event per author, kind and `d` value
//! - regular kinds are always stored; a repeated id is an idempotent no-op
//!
//! Superseded events are removed in the same write that saves the new
//! event, without a tombstone so they can be restored from a backup.
//! Directory kinds keep their history. Deletion events tombstone their
//! targets, again in the same write.

use crate::error::{PublishError, StorageError};
use crate::storage::{EventStore, Removal};
use std::collections::HashSet;
use strand_types::{sort_newest_first, Event, EventId, Filter, Kind, PublicKey};

/// How a publish ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    /// Saved to the store.
    Stored {
        /// Ids removed as a consequence: superseded versions and deletion targets.
        removed: Vec<EventId>,
    },
    /// Ephemeral; nothing was written.
    Ephemeral,
    /// Already stored; nothing changed.
    Duplicate,
}

impl Published {
    /// Whether subscribers should see the event.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Key under which replaceable events supersede each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplaceKey {
    kind: Kind,
    pubkey: PublicKey,
    identifier: Option<String>,
}

impl ReplaceKey {
    fn of(event: &Event) -> Option<Self> {
        let identifier = if event.kind.is_parameterized_replaceable() {
            Some(event.identifier().to_string())
        } else if event.kind.is_replaceable() {
            None
        } else {
            return None;
        };
        Some(Self {
            kind: event.kind,
            pubkey: event.pubkey,
            identifier,
        })
    }

    fn filter(&self) -> Filter {
        Filter::new().authors([self.pubkey]).kinds([self.kind])
    }

    fn matches(&self, event: &Event) -> bool {
        event.kind == self.kind
            && event.pubkey == self.pubkey
            && self
                .identifier
                .as_deref()
                .map_or(true, |d| event.identifier() == d)
    }
}

/// Whether `a` wins over `b` for the same replaceable key.
fn supersedes(a: &Event, b: &Event) -> bool {
    a.created_at > b.created_at || (a.created_at == b.created_at && a.id < b.id)
}

/// Store `event` according to its kind class.
///
/// Superseded versions and deletion targets are resolved first and removed
/// in the same store write as the save, so the event is never stored
/// without its effects. `now` is used to refuse already-expired events.
pub async fn publish(
    store: &dyn EventStore,
    event: &Event,
    now: u64,
) -> Result<Published, PublishError> {
    if event.is_expired(now) {
        return Err(PublishError::Expired);
    }
    if event.kind.is_ephemeral() {
        return Ok(Published::Ephemeral);
    }

    let mut removals = Vec::new();
    if let Some(key) = ReplaceKey::of(event) {
        for existing in store.query(&key.filter()).await? {
            if !key.matches(&existing) {
                continue;
            }
            if existing.id == event.id {
                return Ok(Published::Duplicate);
            }
            if supersedes(&existing, event) {
                return Err(PublishError::NewerExists);
            }
            if !event.kind.is_directory() {
                removals.push(Removal {
                    id: existing.id,
                    tombstone: false,
                });
            }
        }
    }
    if event.kind.is_deletion() {
        removals.extend(
            deletion_targets(store, event)
                .await?
                .into_iter()
                .map(|id| Removal { id, tombstone: true }),
        );
    }

    match store.save_with(event, &removals).await {
        Ok(()) => {}
        Err(StorageError::Duplicate) => return Ok(Published::Duplicate),
        Err(StorageError::Tombstoned) => return Err(PublishError::Tombstoned),
        Err(e) => return Err(PublishError::Storage(e)),
    }

    for removal in &removals {
        tracing::debug!(
            "Removed {} on behalf of {} (tombstone: {})",
            removal.id,
            event.id,
            removal.tombstone
        );
    }
    Ok(Published::Stored {
        removed: removals.into_iter().map(|r| r.id).collect(),
    })
}

/// Stored events a deletion event removes.
///
/// Only targets by the same author, created no later than the deletion,
/// and not themselves deletions qualify.
pub async fn deletion_targets(
    store: &dyn EventStore,
    deletion: &Event,
) -> Result<Vec<EventId>, StorageError> {
    let mut candidates: Vec<Event> = Vec::new();

    let ids: Vec<EventId> = deletion.tags.iter().filter_map(|t| t.event_ref()).collect();
    if !ids.is_empty() {
        candidates.extend(store.query(&Filter::new().ids(ids)).await?);
    }

    for (kind, pubkey, identifier) in deletion.tags.iter().filter_map(|t| t.coordinate_ref()) {
        let filter = Filter::new().authors([pubkey]).kinds([kind]);
        let found = store.query(&filter).await?;
        candidates.extend(
            found
                .into_iter()
                .filter(|e| !kind.is_parameterized_replaceable() || e.identifier() == identifier),
        );
    }

    let mut seen = HashSet::new();
    Ok(candidates
        .into_iter()
        .filter(|target| {
            target.pubkey == deletion.pubkey
                && target.created_at <= deletion.created_at
                && !target.kind.is_deletion()
        })
        .filter_map(|target| seen.insert(target.id).then_some(target.id))
        .collect())
}

/// Drop expired events and all but the newest per replaceable key.
/// `events` must be sorted newest first.
fn visible(mut events: Vec<Event>, now: u64) -> Vec<Event> {
    let mut keys = HashSet::new();
    events.retain(|e| {
        if e.is_expired(now) {
            return false;
        }
        match ReplaceKey::of(e) {
            Some(key) => keys.insert(key),
            None => true,
        }
    });
    events
}

/// Query through the store, presenting the logical view:
/// only the newest event per replaceable key, no expired events,
/// newest first.
///
/// Hidden rows do not count against `filter.limit`: the store is asked for
/// progressively more rows until the limit is filled or it runs out.
pub async fn query(
    store: &dyn EventStore,
    filter: &Filter,
    now: u64,
) -> Result<Vec<Event>, StorageError> {
    let Some(limit) = filter.limit else {
        let mut events = store.query(filter).await?;
        sort_newest_first(&mut events);
        return Ok(visible(events, now));
    };

    let mut fetch = filter.clone();
    loop {
        let wanted = fetch.limit.unwrap_or(limit);
        let mut raw = store.query(&fetch).await?;
        let exhausted = (raw.len() as u64) < wanted;
        sort_newest_first(&mut raw);
        let mut events = visible(raw, now);
        if exhausted || events.len() as u64 >= limit {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            return Ok(events);
        }
        fetch.limit = Some(wanted.saturating_mul(2));
    }
}
