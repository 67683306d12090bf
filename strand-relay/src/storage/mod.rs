//! Storage layer for strand-relay.
//!
//! [`EventStore`] is the contract the relay needs from a backend: save,
//! delete (optionally leaving a tombstone) and query by filter. Counting is
//! an optional capability exposed through [`EventStore::counter`], probed
//! once when the relay is built.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use strand_types::{CountResult, Event, EventId, Filter};

/// A stored event to drop in the same write as a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub id: EventId,
    /// Leave a tombstone so the id can never be saved again.
    pub tombstone: bool,
}

/// Trait for event storage backends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` and apply `removals` as one atomic write.
    ///
    /// Fails with [`StorageError::Duplicate`] if the id is already stored and
    /// with [`StorageError::Tombstoned`] if the id was deleted with a tombstone.
    /// On any error nothing is written.
    async fn save_with(&self, event: &Event, removals: &[Removal]) -> Result<(), StorageError>;

    /// Persist an event on its own.
    async fn save(&self, event: &Event) -> Result<(), StorageError> {
        self.save_with(event, &[]).await
    }

    /// Remove an event. With `tombstone`, the id can never be saved again.
    ///
    /// Deleting an unknown id is not an error.
    async fn delete(&self, id: &EventId, tombstone: bool) -> Result<(), StorageError>;

    /// Events matching `filter`, newest first, ties by ascending id,
    /// truncated to `filter.limit` when set.
    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, StorageError>;

    /// Remove events whose expiration is at or before `now`.
    ///
    /// Returns the number of events removed.
    async fn delete_expired(&self, now: u64) -> Result<u64, StorageError>;

    /// Counting capability, if the backend offers one.
    fn counter(&self) -> Option<Arc<dyn EventCounter>> {
        None
    }
}

/// Optional capability: count matching events without fetching them.
#[async_trait]
pub trait EventCounter: Send + Sync {
    /// Count events matching `filter`, ignoring its `limit`.
    async fn count(&self, filter: &Filter) -> Result<CountResult, StorageError>;
}
