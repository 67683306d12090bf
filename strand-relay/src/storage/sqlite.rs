//! SQLite storage backend for strand-relay.

use super::{EventCounter, EventStore, Removal};
use crate::error::StorageError;
use crate::server::unix_now;
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use strand_types::{CountResult, Event, EventId, Filter};

/// SQLite-based event storage.
///
/// Events are stored as their raw JSON plus indexed columns. Single-letter
/// tags go into a side table so `#x` constraints can be answered in SQL.
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at `path`.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:").map_err(StorageError::Database)?;

        // One connection that never recycles, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id BLOB PRIMARY KEY,
                pubkey BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                expires_at INTEGER,
                raw TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                event_id BLOB NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tombstones (
                id BLOB PRIMARY KEY,
                deleted_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind_created ON events(kind, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_expires ON events(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_tags_name_value ON tags(name, value)",
            "CREATE INDEX IF NOT EXISTS idx_tags_event ON tags(event_id)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// SQLite integers are signed; clamp timestamps beyond i64.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Remove one event (and its tags) inside `tx`, optionally tombstoning it.
async fn remove_in(
    tx: &mut Transaction<'_, Sqlite>,
    id: &EventId,
    tombstone: bool,
) -> Result<(), StorageError> {
    let id = id.as_bytes().as_slice();
    sqlx::query("DELETE FROM tags WHERE event_id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM events WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    if tombstone {
        sqlx::query("INSERT OR IGNORE INTO tombstones (id, deleted_at) VALUES (?1, ?2)")
            .bind(id)
            .bind(to_sql_int(unix_now()))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Append the WHERE conditions for `filter` to a query that already has `WHERE 1=1`.
fn push_conditions(builder: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    if let Some(ids) = filter.ids.as_ref().filter(|v| !v.is_empty()) {
        builder.push(" AND id IN (");
        let mut list = builder.separated(", ");
        for id in ids {
            list.push_bind(id.as_bytes().to_vec());
        }
        list.push_unseparated(")");
    }
    if let Some(authors) = filter.authors.as_ref().filter(|v| !v.is_empty()) {
        builder.push(" AND pubkey IN (");
        let mut list = builder.separated(", ");
        for author in authors {
            list.push_bind(author.as_bytes().to_vec());
        }
        list.push_unseparated(")");
    }
    if let Some(kinds) = filter.kinds.as_ref().filter(|v| !v.is_empty()) {
        builder.push(" AND kind IN (");
        let mut list = builder.separated(", ");
        for kind in kinds {
            list.push_bind(i64::from(kind.as_u16()));
        }
        list.push_unseparated(")");
    }
    if let Some(since) = filter.since {
        builder.push(" AND created_at >= ").push_bind(to_sql_int(since));
    }
    if let Some(until) = filter.until {
        builder.push(" AND created_at <= ").push_bind(to_sql_int(until));
    }
    for (letter, values) in &filter.tags {
        if values.is_empty() {
            continue;
        }
        builder
            .push(" AND EXISTS (SELECT 1 FROM tags t WHERE t.event_id = events.id AND t.name = ")
            .push_bind(letter.to_string())
            .push(" AND t.value IN (");
        let mut list = builder.separated(", ");
        for value in values {
            list.push_bind(value.clone());
        }
        list.push_unseparated("))");
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn save_with(&self, event: &Event, removals: &[Removal]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(event)?;
        let id = event.id.as_bytes().as_slice();

        let mut tx = self.pool.begin().await?;

        let tombstoned: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tombstones WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if tombstoned.is_some() {
            return Err(StorageError::Tombstoned);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (id, pubkey, created_at, kind, expires_at, raw)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(event.pubkey.as_bytes().as_slice())
        .bind(to_sql_int(event.created_at))
        .bind(i64::from(event.kind.as_u16()))
        .bind(event.expiration().map(to_sql_int))
        .bind(&raw)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StorageError::Duplicate);
        }

        for tag in &event.tags {
            let (Some(name), Some(value)) = (tag.name(), tag.value()) else {
                continue;
            };
            if name.chars().count() != 1 {
                continue;
            }
            sqlx::query("INSERT INTO tags (event_id, name, value) VALUES (?1, ?2, ?3)")
                .bind(id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        for removal in removals {
            remove_in(&mut tx, &removal.id, removal.tombstone).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &EventId, tombstone: bool) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        remove_in(&mut tx, id, tombstone).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, StorageError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT raw FROM events WHERE 1=1");
        push_conditions(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(to_sql_int(limit));
        }

        let rows: Vec<String> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(StorageError::Codec))
            .collect()
    }

    async fn delete_expired(&self, now: u64) -> Result<u64, StorageError> {
        let now = to_sql_int(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM tags WHERE event_id IN (
                SELECT id FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1
            )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result =
            sqlx::query("DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    fn counter(&self) -> Option<Arc<dyn EventCounter>> {
        Some(Arc::new(self.clone()))
    }
}

#[async_trait]
impl EventCounter for SqliteStore {
    async fn count(&self, filter: &Filter) -> Result<CountResult, StorageError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM events WHERE 1=1");
        push_conditions(&mut builder, filter);
        builder
            .push(" AND (expires_at IS NULL OR expires_at > ")
            .push_bind(to_sql_int(unix_now()))
            .push(")");

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        Ok(CountResult {
            count: count.max(0) as u64,
            approximate: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::{Keys, Kind, UnsignedEvent};

    fn keys(seed: u8) -> Keys {
        Keys::from_secret_bytes(&[seed; 32]).unwrap()
    }

    fn note(keys: &Keys, content: &str, created_at: u64) -> Event {
        keys.sign(UnsignedEvent::new(Kind(1), content, created_at))
            .unwrap()
    }

    #[tokio::test]
    async fn save_and_query_by_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ev = note(&keys(1), "hello", 100);
        store.save(&ev).await.unwrap();

        let found = store.query(&Filter::new().ids([ev.id])).await.unwrap();
        assert_eq!(found, vec![ev]);
    }

    #[tokio::test]
    async fn duplicate_save_is_reported() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ev = note(&keys(1), "hello", 100);
        store.save(&ev).await.unwrap();
        assert!(matches!(store.save(&ev).await, Err(StorageError::Duplicate)));
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_limits() {
        let store = SqliteStore::in_memory().await.unwrap();
        let k = keys(1);
        for t in [10, 30, 20] {
            store.save(&note(&k, &t.to_string(), t)).await.unwrap();
        }

        let all = store.query(&Filter::new()).await.unwrap();
        let times: Vec<u64> = all.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![30, 20, 10]);

        let limited = store.query(&Filter::new().limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].created_at, 30);
    }

    #[tokio::test]
    async fn ties_break_by_ascending_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = note(&keys(1), "a", 50);
        let b = note(&keys(2), "b", 50);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let found = store.query(&Filter::new()).await.unwrap();
        assert!(found[0].id < found[1].id);
    }

    #[tokio::test]
    async fn query_by_author_kind_time_and_tag() {
        let store = SqliteStore::in_memory().await.unwrap();
        let alice = keys(1);
        let bob = keys(2);
        let tagged = alice
            .sign(UnsignedEvent::new(Kind(1), "tagged", 200).tag(["t", "rust"]))
            .unwrap();
        store.save(&tagged).await.unwrap();
        store.save(&note(&alice, "old", 100)).await.unwrap();
        store.save(&note(&bob, "bob", 150)).await.unwrap();

        let by_author = store
            .query(&Filter::new().authors([alice.public_key()]))
            .await
            .unwrap();
        assert_eq!(by_author.len(), 2);

        let by_tag = store.query(&Filter::new().tag('t', ["rust"])).await.unwrap();
        assert_eq!(by_tag, vec![tagged.clone()]);

        let window = store
            .query(&Filter::new().since(120).until(180))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].pubkey, bob.public_key());

        let wrong_kind = store.query(&Filter::new().kinds([Kind(7)])).await.unwrap();
        assert!(wrong_kind.is_empty());
    }

    #[tokio::test]
    async fn tombstone_blocks_resave() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ev = note(&keys(1), "doomed", 100);
        store.save(&ev).await.unwrap();
        store.delete(&ev.id, true).await.unwrap();

        assert!(store.query(&Filter::new().ids([ev.id])).await.unwrap().is_empty());
        assert!(matches!(store.save(&ev).await, Err(StorageError::Tombstoned)));
    }

    #[tokio::test]
    async fn save_with_removals_is_one_write() {
        let store = SqliteStore::in_memory().await.unwrap();
        let k = keys(1);
        let old = note(&k, "old", 100);
        let doomed = note(&k, "doomed", 101);
        store.save(&old).await.unwrap();
        store.save(&doomed).await.unwrap();

        let deletion = note(&k, "deletion", 200);
        let removals = [
            Removal { id: old.id, tombstone: false },
            Removal { id: doomed.id, tombstone: true },
        ];
        store.save_with(&deletion, &removals).await.unwrap();
        assert_eq!(store.query(&Filter::new()).await.unwrap(), vec![deletion.clone()]);
        assert!(matches!(store.save(&doomed).await, Err(StorageError::Tombstoned)));
        store.save(&old).await.unwrap();

        // A failed save leaves its removals undone
        assert!(matches!(
            store.save_with(&deletion, &[Removal { id: old.id, tombstone: true }]).await,
            Err(StorageError::Duplicate)
        ));
        assert_eq!(store.query(&Filter::new().ids([old.id])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plain_delete_allows_resave() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ev = note(&keys(1), "replaced", 100);
        store.save(&ev).await.unwrap();
        store.delete(&ev.id, false).await.unwrap();
        store.save(&ev).await.unwrap();
    }

    #[tokio::test]
    async fn delete_expired_removes_only_past_events() {
        let store = SqliteStore::in_memory().await.unwrap();
        let k = keys(1);
        let expiring = k
            .sign(UnsignedEvent::new(Kind(1), "", 10).tag(["expiration", "50"]))
            .unwrap();
        let later = k
            .sign(UnsignedEvent::new(Kind(1), "", 10).tag(["expiration", "500"]))
            .unwrap();
        let forever = note(&k, "forever", 10);
        for ev in [&expiring, &later, &forever] {
            store.save(ev).await.unwrap();
        }

        assert_eq!(store.delete_expired(100).await.unwrap(), 1);
        let left = store.query(&Filter::new()).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|e| e.id != expiring.id));
    }

    #[tokio::test]
    async fn count_ignores_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        let k = keys(1);
        for t in 0..5 {
            store.save(&note(&k, "", t)).await.unwrap();
        }
        let counter = store.counter().unwrap();
        let result = counter.count(&Filter::new().limit(1)).await.unwrap();
        assert_eq!(result.count, 5);
        assert_eq!(result.approximate, None);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let ev = note(&keys(1), "durable", 100);
        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.save(&ev).await.unwrap();
        }
        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.query(&Filter::new()).await.unwrap(), vec![ev]);
    }
}
