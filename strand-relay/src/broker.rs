//! Subscription broker: live subscriptions and event fan-out.
//!
//! The broker owns one registry mapping each live connection to its
//! outbound queue, its session and its subscriptions. Fan-out snapshots
//! the matching targets under the read lock and queues after releasing it
//! without waiting, so a slow connection never holds up acceptance
//! elsewhere. A subscriber whose queue is full is disconnected.

use crate::access::can_see;
use crate::session::{ConnectionId, ConnectionSession};
use std::collections::HashMap;
use std::sync::Arc;
use strand_types::{Event, FilterSet, RelayEnvelope, SubscriptionId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Sending half of a connection's bounded outbound queue, plus the token
/// that shuts the connection down.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<RelayEnvelope>,
    closing: CancellationToken,
}

impl Outbound {
    /// A queue holding up to `capacity` envelopes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbound = Self {
            tx,
            closing: CancellationToken::new(),
        };
        (outbound, rx)
    }

    /// Cancelled once the connection is shutting down.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Queue a reply, waiting for room. Returns false once the connection
    /// is closing.
    pub async fn send(&self, envelope: RelayEnvelope) -> bool {
        tokio::select! {
            sent = self.tx.send(envelope) => sent.is_ok(),
            _ = self.closing.cancelled() => false,
        }
    }

    /// Queue without waiting. A full queue closes the connection.
    pub fn offer(&self, envelope: RelayEnvelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.closing.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Why a subscription could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The connection is not (or no longer) registered.
    #[error("connection is closed")]
    UnknownConnection,
    /// The connection already holds the maximum number of subscriptions.
    #[error("too many subscriptions (limit: {0})")]
    TooMany(usize),
}

struct Listener {
    outbound: Outbound,
    session: Arc<ConnectionSession>,
    subscriptions: HashMap<SubscriptionId, FilterSet>,
}

/// Registry of live connections and their subscriptions.
pub struct Broker {
    listeners: RwLock<HashMap<ConnectionId, Listener>>,
    max_subscriptions: usize,
    queue_capacity: usize,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("max_subscriptions", &self.max_subscriptions)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create an empty broker allowing `max_subscriptions` per connection.
    /// Channel subscribers get queues of `queue_capacity`.
    pub fn new(max_subscriptions: usize, queue_capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            max_subscriptions,
            queue_capacity,
        }
    }

    /// Register a connection and the queue its envelopes go to.
    pub async fn register(&self, session: Arc<ConnectionSession>, outbound: Outbound) {
        let id = session.id();
        let mut listeners = self.listeners.write().await;
        listeners.insert(
            id,
            Listener {
                outbound,
                session,
                subscriptions: HashMap::new(),
            },
        );
        tracing::debug!("Registered connection {} (total: {})", id, listeners.len());
    }

    /// Whether `subscription_id` could be added (or replaced) on `connection`.
    pub async fn has_room(&self, connection: ConnectionId, subscription_id: &SubscriptionId) -> bool {
        let listeners = self.listeners.read().await;
        listeners.get(&connection).is_some_and(|l| {
            l.subscriptions.contains_key(subscription_id)
                || l.subscriptions.len() < self.max_subscriptions
        })
    }

    /// Add or replace a subscription.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        subscription_id: SubscriptionId,
        filters: FilterSet,
    ) -> Result<(), SubscribeError> {
        let mut listeners = self.listeners.write().await;
        let listener = listeners
            .get_mut(&connection)
            .ok_or(SubscribeError::UnknownConnection)?;
        if !listener.subscriptions.contains_key(&subscription_id)
            && listener.subscriptions.len() >= self.max_subscriptions
        {
            return Err(SubscribeError::TooMany(self.max_subscriptions));
        }
        tracing::debug!("Subscription {} on connection {}", subscription_id, connection);
        listener.subscriptions.insert(subscription_id, filters);
        Ok(())
    }

    /// Remove one subscription. Unknown ids are ignored.
    pub async fn unsubscribe(&self, connection: ConnectionId, subscription_id: &SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().await;
        listeners
            .get_mut(&connection)
            .is_some_and(|l| l.subscriptions.remove(subscription_id).is_some())
    }

    /// Drop a connection and all its subscriptions.
    ///
    /// Returns how many subscriptions were removed, or `None` if the
    /// connection was already gone.
    pub async fn remove_connection(&self, connection: ConnectionId) -> Option<usize> {
        let removed = self.listeners.write().await.remove(&connection)?;
        tracing::debug!(
            "Unregistered connection {} ({} subscriptions)",
            connection,
            removed.subscriptions.len()
        );
        Some(removed.subscriptions.len())
    }

    /// Deliver `event` to every matching subscription the owner may see it on.
    ///
    /// Returns the number of envelopes queued.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let targets: Vec<(ConnectionId, Outbound, SubscriptionId)> = {
            let listeners = self.listeners.read().await;
            listeners
                .iter()
                .filter(|(_, l)| can_see(event, l.session.authed()))
                .flat_map(|(connection, l)| {
                    l.subscriptions
                        .iter()
                        .filter(|(_, filters)| filters.matches(event))
                        .map(|(id, _)| (*connection, l.outbound.clone(), id.clone()))
                })
                .collect()
        };

        let mut sent = 0;
        for (connection, outbound, subscription_id) in targets {
            let envelope = RelayEnvelope::Event {
                subscription_id,
                event: event.clone(),
            };
            if outbound.offer(envelope) {
                sent += 1;
            } else if outbound.closing().is_cancelled() {
                tracing::warn!("Connection {} is not keeping up, disconnecting", connection);
            }
        }
        if sent > 0 {
            tracing::debug!("Fanned out {} to {} subscriptions", event.id, sent);
        }
        sent
    }

    /// Register a subscription for a non-socket consumer.
    ///
    /// The session is registered as its own connection; live events arrive
    /// on the returned receiver. Call [`Self::remove_connection`] with the
    /// session id when done.
    pub async fn subscribe_channel(
        &self,
        session: Arc<ConnectionSession>,
        subscription_id: SubscriptionId,
        filters: FilterSet,
    ) -> Result<mpsc::Receiver<RelayEnvelope>, SubscribeError> {
        let (tx, rx) = Outbound::channel(self.queue_capacity);
        let id = session.id();
        self.register(session, tx).await;
        self.subscribe(id, subscription_id, filters).await?;
        Ok(rx)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Number of live subscriptions across all connections.
    pub async fn subscription_count(&self) -> usize {
        self.listeners
            .read()
            .await
            .values()
            .map(|l| l.subscriptions.len())
            .sum()
    }
}
