//! Main relay coordination.
//!
//! [`Relay`] owns the store, access control, broker, rate limiters and
//! metrics, and exposes the operations every transport shares: submitting
//! an event, reading a backlog and counting.

use crate::access::{can_see, AccessControl, Verdict};
use crate::broker::Broker;
use crate::config::Config;
use crate::error::{ProtocolError, PublishError, RelayError, StorageError};
use crate::limits::RateLimits;
use crate::publish::{self, Published};
use crate::session::ConnectionSession;
use crate::storage::{EventCounter, EventStore, SqliteStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use strand_types::{
    kind, sort_newest_first, CountResult, Event, Filter, FilterSet, Kind, PublicKey, Reason,
};

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Total EVENT submissions received.
    pub events_received: AtomicU64,
    /// Total events stored (or fanned out, for ephemeral kinds).
    pub events_stored: AtomicU64,
    /// Total events rejected by admission, policy or storage.
    pub events_rejected: AtomicU64,
    /// Total event envelopes queued to subscribers.
    pub deliveries_total: AtomicU64,
    /// Total subscriptions opened.
    pub subscriptions_total: AtomicU64,
    /// Total rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Total protocol and storage errors.
    pub errors_total: AtomicU64,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Clamp a requested query limit to the configured bounds.
pub fn clamp_query_limit(requested: Option<u64>, default: u64, max: u64) -> u64 {
    requested.unwrap_or(default).min(max)
}

/// Main relay server.
pub struct Relay {
    config: Config,
    store: Arc<dyn EventStore>,
    /// Counting capability, probed once at construction.
    counter: Option<Arc<dyn EventCounter>>,
    access: AccessControl,
    broker: Broker,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("counting", &self.counter.is_some())
            .field("access", &self.access)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay over `store`.
    pub fn new(config: Config, store: Arc<dyn EventStore>) -> Result<Self, RelayError> {
        config.validate()?;
        let owners = config.owner_keys()?;
        let counter = store.counter();
        tracing::info!(
            owners = owners.len(),
            counting = counter.is_some(),
            "Relay configured"
        );

        Ok(Self {
            access: AccessControl::new(&config.access, owners, store.clone()),
            broker: Broker::new(config.limits.max_subscriptions, config.limits.outbound_queue),
            rate_limits: RateLimits::new(&config.limits),
            metrics: RelayMetrics::default(),
            next_connection: AtomicU64::new(1),
            counter,
            store,
            config,
        })
    }

    /// Open the configured SQLite database and build a relay over it.
    pub async fn open(config: Config) -> Result<Self, RelayError> {
        let store = SqliteStore::new(&config.storage.database).await?;
        tracing::info!("Opened database {}", config.storage.database.display());
        Self::new(config, Arc::new(store))
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Get the access control state.
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Get the subscription broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Whether the store can count.
    pub fn can_count(&self) -> bool {
        self.counter.is_some()
    }

    /// Allocate a session for a new connection.
    pub fn open_session(
        &self,
        remote: impl Into<String>,
    ) -> Result<ConnectionSession, ProtocolError> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        ConnectionSession::new(id, remote)
    }

    /// Checks every event passes before policy: integrity and timestamps.
    fn admit(&self, event: &Event, now: u64) -> Result<(), Reason> {
        event.check_id().map_err(|e| Reason::invalid(e.to_string()))?;
        event
            .check_signature()
            .map_err(|e| Reason::invalid(e.to_string()))?;
        if event.created_at > now.saturating_add(self.config.limits.max_future_secs) {
            return Err(Reason::invalid("created_at is too far in the future"));
        }
        if event.is_expired(now) {
            return Err(Reason::invalid("event has expired"));
        }
        if event.kind == kind::CLIENT_AUTHENTICATION {
            return Err(Reason::invalid("authentication events belong in AUTH messages"));
        }
        Ok(())
    }

    /// Run an inbound event through admission, policy, storage and fan-out.
    pub async fn submit(
        &self,
        event: &Event,
        identity: Option<&PublicKey>,
        remote: &str,
    ) -> Result<Published, Reason> {
        self.metrics.events_received.fetch_add(1, Ordering::Relaxed);
        let result = self.submit_inner(event, identity, remote).await;
        match &result {
            Ok(Published::Duplicate) => {}
            Ok(_) => {
                self.metrics.events_stored.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn submit_inner(
        &self,
        event: &Event,
        identity: Option<&PublicKey>,
        remote: &str,
    ) -> Result<Published, Reason> {
        let now = unix_now();
        self.admit(event, now)?;

        let post_commit = match self.access.accept_event(event, identity, remote).await {
            Verdict::Accept(actions) => actions,
            Verdict::Reject(reason) => return Err(reason),
        };

        let published = match publish::publish(self.store.as_ref(), event, now).await {
            Ok(published) => published,
            Err(PublishError::NewerExists) => {
                return Err(Reason::blocked("not replacing newer event"))
            }
            Err(PublishError::Tombstoned) => {
                return Err(Reason::blocked("event was deleted, not storing it again"))
            }
            Err(PublishError::Expired) => return Err(Reason::invalid("event has expired")),
            Err(PublishError::Storage(e)) => {
                tracing::error!("Failed to store event {}: {}", event.id, e);
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                return Err(Reason::error("failed to store event"));
            }
        };

        if published.is_new() {
            self.access.run_post_commit(&post_commit).await;
            let sent = self.broker.broadcast(event).await;
            self.metrics
                .deliveries_total
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
        Ok(published)
    }

    /// One-shot query for the filters, as `identity` may see it.
    ///
    /// Each filter's limit is clamped; a limit of zero skips that filter.
    pub async fn backlog(
        &self,
        filters: &FilterSet,
        identity: Option<&PublicKey>,
    ) -> Result<Vec<Event>, StorageError> {
        let limits = &self.config.limits;
        let now = unix_now();
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for filter in filters {
            let limit =
                clamp_query_limit(filter.limit, limits.default_query_limit, limits.max_query_limit);
            if limit == 0 {
                continue;
            }
            let mut bounded = filter.clone();
            bounded.limit = Some(limit);
            for event in publish::query(self.store.as_ref(), &bounded, now).await? {
                if can_see(&event, identity) && seen.insert(event.id) {
                    events.push(event);
                }
            }
        }

        sort_newest_first(&mut events);
        Ok(events)
    }

    /// Count matching events `identity` may see, or `None` if the store
    /// cannot count.
    ///
    /// Counts of several filters are summed and flagged approximate.
    pub async fn count(
        &self,
        filters: &FilterSet,
        identity: Option<&PublicKey>,
    ) -> Option<Result<CountResult, StorageError>> {
        let counter = self.counter.as_ref()?;
        let mut total = 0u64;
        for filter in filters {
            match self.count_visible(counter.as_ref(), filter, identity).await {
                Ok(count) => total = total.saturating_add(count),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(CountResult {
            count: total,
            approximate: (filters.len() > 1).then_some(true),
        }))
    }

    /// Count one filter, leaving out privileged events hidden from `identity`.
    async fn count_visible(
        &self,
        counter: &dyn EventCounter,
        filter: &Filter,
        identity: Option<&PublicKey>,
    ) -> Result<u64, StorageError> {
        let requested = filter.requested_kinds();
        let private: Vec<Kind> = if requested.is_empty() {
            kind::PRIVILEGED.to_vec()
        } else {
            requested.iter().copied().filter(|k| k.is_privileged()).collect()
        };

        let total = counter.count(filter).await?.count;
        if private.is_empty() {
            return Ok(total);
        }

        let mut scope = filter.clone();
        scope.kinds = Some(private);
        scope.limit = None;
        let stored_private = counter.count(&scope).await?.count;
        let visible_private = match identity {
            None => 0,
            Some(_) => publish::query(self.store.as_ref(), &scope, unix_now())
                .await?
                .iter()
                .filter(|e| can_see(e, identity))
                .count() as u64,
        };
        Ok(total.saturating_sub(stored_private) + visible_private)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use strand_types::{Keys, UnsignedEvent};

    fn keys(seed: u8) -> Keys {
        Keys::from_secret_bytes(&[seed; 32]).unwrap()
    }

    async fn relay(config: Config) -> Relay {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        Relay::new(config, store).unwrap()
    }

    fn note(keys: &Keys, content: &str) -> Event {
        keys.sign(UnsignedEvent::new(kind::TEXT_NOTE, content, unix_now()))
            .unwrap()
    }

    #[test]
    fn clamp_limits() {
        assert_eq!(clamp_query_limit(None, 100, 500), 100);
        assert_eq!(clamp_query_limit(Some(10), 100, 500), 10);
        assert_eq!(clamp_query_limit(Some(10_000), 100, 500), 500);
        assert_eq!(clamp_query_limit(Some(0), 100, 500), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = Config::default();
        config.access.owners = vec!["zz".into()];
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        assert!(matches!(
            Relay::new(config, store),
            Err(RelayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn open_persists_to_the_configured_file() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.database = dir.path().join("relay.db");

        let ev = note(&keys(1), "kept");
        {
            let relay = Relay::open(config.clone()).await.unwrap();
            relay.submit(&ev, None, "t").await.unwrap();
        }
        let relay = Relay::open(config).await.unwrap();
        let all = FilterSet::new(vec![Filter::new()]);
        assert_eq!(relay.backlog(&all, None).await.unwrap(), vec![ev]);
    }

    #[tokio::test]
    async fn submit_stores_and_fans_out() {
        let relay = relay(Config::default()).await;
        let session = Arc::new(relay.open_session("test").unwrap());
        let mut rx = relay
            .broker()
            .subscribe_channel(
                session,
                "all".into(),
                FilterSet::new(vec![Filter::new().kinds([kind::TEXT_NOTE])]),
            )
            .await
            .unwrap();

        let ev = note(&keys(1), "hello");
        assert!(matches!(
            relay.submit(&ev, None, "test").await,
            Ok(Published::Stored { .. })
        ));
        assert!(rx.try_recv().is_ok());

        assert_eq!(relay.submit(&ev, None, "test").await, Ok(Published::Duplicate));
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.metrics().events_stored.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bad_id_is_rejected_before_storage() {
        let relay = relay(Config::default()).await;
        let mut ev = note(&keys(1), "hello");
        ev.content = "changed".into();

        let reason = relay.submit(&ev, None, "test").await.unwrap_err();
        assert_eq!(reason.to_string(), "invalid: event id is computed incorrectly");
        assert!(relay
            .backlog(&FilterSet::new(vec![Filter::new()]), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn future_and_auth_events_are_refused() {
        let relay = relay(Config::default()).await;
        let k = keys(1);
        let future = k
            .sign(UnsignedEvent::new(kind::TEXT_NOTE, "", unix_now() + 86_400))
            .unwrap();
        assert!(relay.submit(&future, None, "t").await.is_err());

        let auth = k
            .sign(UnsignedEvent::new(kind::CLIENT_AUTHENTICATION, "", unix_now()))
            .unwrap();
        assert!(relay.submit(&auth, None, "t").await.is_err());
    }

    #[tokio::test]
    async fn backlog_respects_limits_and_privacy() {
        let relay = relay(Config::default()).await;
        let alice = keys(1);
        let bob = keys(2);
        for i in 0..3 {
            relay.submit(&note(&alice, &i.to_string()), None, "t").await.unwrap();
        }
        let dm = alice
            .sign(
                UnsignedEvent::new(kind::ENCRYPTED_DIRECT_MESSAGE, "", unix_now())
                    .tag(["p".to_string(), bob.public_key().to_hex()]),
            )
            .unwrap();
        relay.submit(&dm, None, "t").await.unwrap();

        let notes = FilterSet::new(vec![Filter::new().kinds([kind::TEXT_NOTE]).limit(2)]);
        assert_eq!(relay.backlog(&notes, None).await.unwrap().len(), 2);

        let zero = FilterSet::new(vec![Filter::new().limit(0)]);
        assert!(relay.backlog(&zero, None).await.unwrap().is_empty());

        let dms = FilterSet::new(vec![Filter::new().kinds([kind::ENCRYPTED_DIRECT_MESSAGE])]);
        assert!(relay.backlog(&dms, None).await.unwrap().is_empty());
        assert_eq!(
            relay.backlog(&dms, Some(&bob.public_key())).await.unwrap(),
            vec![dm]
        );
    }

    #[tokio::test]
    async fn count_uses_probed_capability() {
        let relay = relay(Config::default()).await;
        assert!(relay.can_count());
        let k = keys(1);
        relay.submit(&note(&k, "a"), None, "t").await.unwrap();
        let reaction = k
            .sign(UnsignedEvent::new(Kind(7), "+", unix_now()))
            .unwrap();
        relay.submit(&reaction, None, "t").await.unwrap();

        let one = FilterSet::new(vec![Filter::new().kinds([kind::TEXT_NOTE])]);
        let result = relay.count(&one, None).await.unwrap().unwrap();
        assert_eq!(result, CountResult { count: 1, approximate: None });

        let two = FilterSet::new(vec![
            Filter::new().kinds([kind::TEXT_NOTE]),
            Filter::new().kinds([Kind(7)]),
        ]);
        let result = relay.count(&two, None).await.unwrap().unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.approximate, Some(true));
    }

    #[tokio::test]
    async fn count_hides_private_events_like_backlog() {
        let relay = relay(Config::default()).await;
        let alice = keys(1);
        let bob = keys(2);
        relay.submit(&note(&alice, "public"), None, "t").await.unwrap();
        let dm = alice
            .sign(
                UnsignedEvent::new(kind::ENCRYPTED_DIRECT_MESSAGE, "", unix_now())
                    .tag(["p".to_string(), bob.public_key().to_hex()]),
            )
            .unwrap();
        relay.submit(&dm, None, "t").await.unwrap();

        let dms = FilterSet::new(vec![Filter::new().kinds([kind::ENCRYPTED_DIRECT_MESSAGE])]);
        let everything = FilterSet::new(vec![Filter::new()]);
        let count = |result: Option<Result<CountResult, StorageError>>| result.unwrap().unwrap().count;
        let bob_key = bob.public_key();
        let carol_key = keys(3).public_key();

        assert_eq!(count(relay.count(&dms, None).await), 0);
        assert_eq!(count(relay.count(&everything, None).await), 1);
        assert_eq!(count(relay.count(&dms, Some(&bob_key)).await), 1);
        assert_eq!(count(relay.count(&everything, Some(&bob_key)).await), 2);
        assert_eq!(count(relay.count(&dms, Some(&carol_key)).await), 0);
    }
}
