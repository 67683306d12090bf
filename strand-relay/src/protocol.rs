//! Client message dispatch.
//!
//! [`handle_frame`] decodes one inbound frame and answers it on the
//! connection's outbound queue. A connection's frames are handled one at a
//! time in arrival order.

use crate::access::ReadDecision;
use crate::broker::{Outbound, SubscribeError};
use crate::error::ProtocolError;
use crate::publish::Published;
use crate::server::{unix_now, Relay};
use crate::session::{request_auth, ConnectionSession};
use std::sync::atomic::Ordering;
use strand_types::{
    ClientEnvelope, Event, FilterSet, Reason, ReasonPrefix, RelayEnvelope, SubscriptionId,
};

/// Handle one inbound frame.
///
/// Every frame counts against the rate limits, whatever its type and
/// whether or not it decodes.
pub async fn handle_frame(
    relay: &Relay,
    session: &ConnectionSession,
    outbound: &Outbound,
    frame: &[u8],
) {
    let rate = check_rate(relay, session);

    let limit = relay.config().limits.max_message_size;
    if frame.len() > limit {
        let e = ProtocolError::TooLarge {
            size: frame.len(),
            limit,
        };
        tracing::debug!("Connection {}: {}", session.id(), e);
        let reason = rate.err().unwrap_or_else(|| Reason::invalid(e.to_string()));
        outbound.send(RelayEnvelope::notice(reason)).await;
        return;
    }

    let envelope = match ClientEnvelope::from_json(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            let e = ProtocolError::from(e);
            tracing::debug!("Connection {}: {}", session.id(), e);
            relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
            let reason = rate.err().unwrap_or_else(|| Reason::invalid(e.to_string()));
            outbound.send(RelayEnvelope::notice(reason)).await;
            return;
        }
    };
    tracing::trace!("Connection {} sent {}", session.id(), envelope.label());

    if let Err(reason) = rate {
        let reply = match envelope {
            ClientEnvelope::Event(event) | ClientEnvelope::Auth(event) => {
                RelayEnvelope::ok(event.id, false, reason)
            }
            ClientEnvelope::Req {
                subscription_id, ..
            }
            | ClientEnvelope::Count {
                subscription_id, ..
            } => RelayEnvelope::closed(subscription_id, reason),
            ClientEnvelope::Close(_) => RelayEnvelope::notice(reason),
        };
        outbound.send(reply).await;
        return;
    }

    match envelope {
        ClientEnvelope::Event(event) => handle_event(relay, session, outbound, event).await,
        ClientEnvelope::Req {
            subscription_id,
            filters,
        } => handle_req(relay, session, outbound, subscription_id, filters).await,
        ClientEnvelope::Count {
            subscription_id,
            filters,
        } => handle_count(relay, session, outbound, subscription_id, filters).await,
        ClientEnvelope::Close(subscription_id) => {
            if !relay
                .broker()
                .unsubscribe(session.id(), &subscription_id)
                .await
            {
                tracing::trace!(
                    "Connection {} closed unknown subscription {}",
                    session.id(),
                    subscription_id
                );
            }
        }
        ClientEnvelope::Auth(event) => handle_auth(relay, session, outbound, event).await,
    }
}

fn check_rate(relay: &Relay, session: &ConnectionSession) -> Result<(), Reason> {
    relay.rate_limits().check_request(session.id()).map_err(|e| {
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connection {} rate limited: {}", session.id(), e);
        Reason::rate_limited(e.to_string())
    })
}

/// Refuse a read, asking anonymous callers to authenticate when that helps.
async fn refuse_read(
    session: &ConnectionSession,
    outbound: &Outbound,
    subscription_id: SubscriptionId,
    reason: Reason,
) {
    let needs_auth = reason.prefix == ReasonPrefix::AuthRequired;
    outbound
        .send(RelayEnvelope::closed(subscription_id, reason))
        .await;
    if needs_auth && session.authed().is_none() {
        request_auth(session, outbound).await;
    }
}

async fn handle_event(
    relay: &Relay,
    session: &ConnectionSession,
    outbound: &Outbound,
    event: Event,
) {
    let id = event.id;
    match relay.submit(&event, session.authed(), session.remote()).await {
        Ok(Published::Duplicate) => {
            outbound
                .send(RelayEnvelope::ok(
                    id,
                    true,
                    Reason::duplicate("already have this event"),
                ))
                .await;
        }
        Ok(_) => {
            outbound.send(RelayEnvelope::ok(id, true, "")).await;
        }
        Err(reason) => {
            let needs_auth = reason.prefix == ReasonPrefix::AuthRequired;
            outbound.send(RelayEnvelope::ok(id, false, reason)).await;
            if needs_auth && session.authed().is_none() {
                request_auth(session, outbound).await;
            }
        }
    }
}

async fn handle_req(
    relay: &Relay,
    session: &ConnectionSession,
    outbound: &Outbound,
    subscription_id: SubscriptionId,
    filters: FilterSet,
) {
    let identity = session.authed();
    let (filters, narrowed) = match relay
        .access()
        .accept_read(&filters, identity, session.remote())
        .await
    {
        ReadDecision::Allow { filters, narrowed } => (filters, narrowed),
        ReadDecision::Reject(reason) => {
            return refuse_read(session, outbound, subscription_id, reason).await;
        }
    };

    if !relay.broker().has_room(session.id(), &subscription_id).await {
        outbound
            .send(RelayEnvelope::closed(
                subscription_id,
                Reason::restricted("too many subscriptions"),
            ))
            .await;
        return;
    }

    let backlog = match relay.backlog(&filters, identity).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!("Backlog query failed for {}: {}", subscription_id, e);
            relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
            outbound
                .send(RelayEnvelope::closed(
                    subscription_id,
                    Reason::error("could not query stored events"),
                ))
                .await;
            return;
        }
    };

    let mut sent = 0u64;
    for event in backlog {
        let queued = outbound
            .send(RelayEnvelope::Event {
                subscription_id: subscription_id.clone(),
                event,
            })
            .await;
        if !queued {
            return;
        }
        sent += 1;
    }
    relay
        .metrics()
        .deliveries_total
        .fetch_add(sent, Ordering::Relaxed);

    match relay
        .broker()
        .subscribe(session.id(), subscription_id.clone(), filters)
        .await
    {
        Ok(()) => {
            relay
                .metrics()
                .subscriptions_total
                .fetch_add(1, Ordering::Relaxed);
            outbound.send(RelayEnvelope::Eose(subscription_id)).await;
            if narrowed && identity.is_none() {
                request_auth(session, outbound).await;
            }
        }
        Err(SubscribeError::TooMany(limit)) => {
            outbound
                .send(RelayEnvelope::closed(
                    subscription_id,
                    Reason::restricted(format!("too many subscriptions (limit: {limit})")),
                ))
                .await;
        }
        // Connection is closing
        Err(SubscribeError::UnknownConnection) => {}
    }
}

async fn handle_count(
    relay: &Relay,
    session: &ConnectionSession,
    outbound: &Outbound,
    subscription_id: SubscriptionId,
    filters: FilterSet,
) {
    if !relay.can_count() {
        outbound
            .send(RelayEnvelope::closed(
                subscription_id,
                Reason::unsupported("counting is not supported"),
            ))
            .await;
        return;
    }

    let identity = session.authed();
    let filters = match relay
        .access()
        .accept_read(&filters, identity, session.remote())
        .await
    {
        ReadDecision::Allow { filters, .. } => filters,
        ReadDecision::Reject(reason) => {
            return refuse_read(session, outbound, subscription_id, reason).await;
        }
    };

    let reply = match relay.count(&filters, identity).await {
        Some(Ok(result)) => RelayEnvelope::Count {
            subscription_id,
            result,
        },
        Some(Err(e)) => {
            tracing::error!("Count failed for {}: {}", subscription_id, e);
            relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
            RelayEnvelope::closed(subscription_id, Reason::error("could not count events"))
        }
        None => RelayEnvelope::closed(
            subscription_id,
            Reason::unsupported("counting is not supported"),
        ),
    };
    outbound.send(reply).await;
}

async fn handle_auth(relay: &Relay, session: &ConnectionSession, outbound: &Outbound, event: Event) {
    let config = relay.config();
    let result = session.authenticate(
        &event,
        config.server.relay_url.as_deref(),
        config.limits.auth_window_secs,
        unix_now(),
    );
    let reply = match result {
        Ok(pubkey) => {
            tracing::info!("Connection {} authenticated as {}", session.id(), pubkey);
            RelayEnvelope::ok(event.id, true, "")
        }
        Err(reason) => {
            tracing::debug!("Connection {} auth failed: {}", session.id(), reason);
            RelayEnvelope::ok(event.id, false, reason)
        }
    };
    outbound.send(reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStore;
    use std::sync::Arc;
    use strand_types::{kind, Keys, UnsignedEvent};
    use tokio::sync::mpsc;

    struct Harness {
        relay: Arc<Relay>,
        session: Arc<ConnectionSession>,
        tx: Outbound,
        rx: mpsc::Receiver<RelayEnvelope>,
    }

    impl Harness {
        async fn new(config: Config) -> Self {
            let store = Arc::new(SqliteStore::in_memory().await.unwrap());
            let relay = Arc::new(Relay::new(config, store).unwrap());
            let session = Arc::new(relay.open_session("test").unwrap());
            let (tx, rx) = Outbound::channel(256);
            relay.broker().register(session.clone(), tx.clone()).await;
            Self {
                relay,
                session,
                tx,
                rx,
            }
        }

        async fn send(&mut self, frame: &str) {
            handle_frame(&self.relay, &self.session, &self.tx, frame.as_bytes()).await;
        }

        fn drain(&mut self) -> Vec<RelayEnvelope> {
            let mut out = Vec::new();
            while let Ok(envelope) = self.rx.try_recv() {
                out.push(envelope);
            }
            out
        }
    }

    fn keys(seed: u8) -> Keys {
        Keys::from_secret_bytes(&[seed; 32]).unwrap()
    }

    fn note(keys: &Keys, content: &str) -> Event {
        keys.sign(UnsignedEvent::new(kind::TEXT_NOTE, content, unix_now()))
            .unwrap()
    }

    fn event_frame(event: &Event) -> String {
        ClientEnvelope::Event(event.clone()).to_json()
    }

    #[tokio::test]
    async fn garbage_gets_a_notice() {
        let mut h = Harness::new(Config::default()).await;
        h.send("not json").await;
        h.send(r#"["PING"]"#).await;
        let out = h.drain();
        assert_eq!(out.len(), 2);
        for envelope in out {
            match envelope {
                RelayEnvelope::Notice(message) => assert!(message.starts_with("invalid:")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let mut config = Config::default();
        config.limits.max_message_size = 64;
        let mut h = Harness::new(config).await;
        let ev = note(&keys(1), &"x".repeat(200));
        h.send(&event_frame(&ev)).await;
        assert!(matches!(&h.drain()[..], [RelayEnvelope::Notice(_)]));
    }

    #[tokio::test]
    async fn event_then_duplicate() {
        let mut h = Harness::new(Config::default()).await;
        let ev = note(&keys(1), "hello");
        h.send(&event_frame(&ev)).await;
        h.send(&event_frame(&ev)).await;
        assert_eq!(
            h.drain(),
            vec![
                RelayEnvelope::ok(ev.id, true, ""),
                RelayEnvelope::ok(ev.id, true, "duplicate: already have this event"),
            ]
        );
    }

    #[tokio::test]
    async fn req_sends_backlog_eose_then_live() {
        let mut h = Harness::new(Config::default()).await;
        let k = keys(1);
        let old = note(&k, "old");
        h.send(&event_frame(&old)).await;
        h.drain();

        h.send(r#"["REQ","s1",{"kinds":[1]}]"#).await;
        let sub = SubscriptionId::new("s1");
        assert_eq!(
            h.drain(),
            vec![
                RelayEnvelope::Event {
                    subscription_id: sub.clone(),
                    event: old
                },
                RelayEnvelope::Eose(sub.clone()),
            ]
        );

        let live = note(&k, "live");
        h.send(&event_frame(&live)).await;
        let out = h.drain();
        assert!(out.contains(&RelayEnvelope::Event {
            subscription_id: sub.clone(),
            event: live.clone()
        }));

        h.send(r#"["CLOSE","s1"]"#).await;
        h.send(&event_frame(&note(&k, "after close"))).await;
        assert!(h
            .drain()
            .iter()
            .all(|e| !matches!(e, RelayEnvelope::Event { .. })));
    }

    #[tokio::test]
    async fn subscription_cap_closes_extra_req() {
        let mut config = Config::default();
        config.limits.max_subscriptions = 1;
        let mut h = Harness::new(config).await;
        h.send(r#"["REQ","a",{}]"#).await;
        h.send(r#"["REQ","b",{}]"#).await;
        // Replacing an existing id does not count against the cap
        h.send(r#"["REQ","a",{"kinds":[1]}]"#).await;
        let out = h.drain();
        assert!(out.contains(&RelayEnvelope::closed(
            SubscriptionId::new("b"),
            "restricted: too many subscriptions"
        )));
        assert_eq!(
            out.iter()
                .filter(|e| matches!(e, RelayEnvelope::Eose(_)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn count_reports_stored_events() {
        let mut h = Harness::new(Config::default()).await;
        let k = keys(1);
        for i in 0..3 {
            h.send(&event_frame(&note(&k, &i.to_string()))).await;
        }
        h.drain();
        h.send(r#"["COUNT","c",{"kinds":[1]}]"#).await;
        match &h.drain()[..] {
            [RelayEnvelope::Count { result, .. }] => assert_eq!(result.count, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn restricted_relay_asks_for_auth_on_write() {
        let owner = keys(9);
        let mut config = Config::default();
        config.access.owners = vec![owner.public_key().to_hex()];
        let mut h = Harness::new(config).await;

        let ev = note(&keys(1), "hi");
        h.send(&event_frame(&ev)).await;
        let out = h.drain();
        match &out[..] {
            [RelayEnvelope::Ok {
                accepted: false,
                message,
                ..
            }, RelayEnvelope::Auth { challenge }] => {
                assert!(message.starts_with("auth-required:"));
                assert_eq!(challenge, h.session.challenge());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_then_owner_write_is_accepted() {
        let owner = keys(9);
        let mut config = Config::default();
        config.access.owners = vec![owner.public_key().to_hex()];
        let mut h = Harness::new(config).await;

        let auth = owner
            .sign(
                UnsignedEvent::new(kind::CLIENT_AUTHENTICATION, "", unix_now())
                    .tag(["challenge", h.session.challenge()])
                    .tag(["relay", "wss://anything.example"]),
            )
            .unwrap();
        h.send(&ClientEnvelope::Auth(auth.clone()).to_json()).await;
        assert_eq!(h.drain(), vec![RelayEnvelope::ok(auth.id, true, "")]);
        assert_eq!(h.session.authed(), Some(&owner.public_key()));

        let ev = note(&owner, "mine");
        h.send(&event_frame(&ev)).await;
        assert_eq!(h.drain(), vec![RelayEnvelope::ok(ev.id, true, "")]);
    }

    #[tokio::test]
    async fn narrowed_req_is_followed_by_auth() {
        let mut config = Config::default();
        config.access.owners = vec![keys(9).public_key().to_hex()];
        config.access.public_readable = false;
        let mut h = Harness::new(config).await;

        h.send(r#"["REQ","mixed",{"kinds":[0,1]}]"#).await;
        match &h.drain()[..] {
            [RelayEnvelope::Eose(sub), RelayEnvelope::Auth { .. }] => {
                assert_eq!(sub.as_str(), "mixed")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.session.auth_requested());
    }

    #[tokio::test]
    async fn rate_limited_req_is_closed() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 1;
        let mut h = Harness::new(config).await;
        h.send(r#"["REQ","a",{}]"#).await;
        h.drain();
        h.send(r#"["REQ","b",{}]"#).await;
        match &h.drain()[..] {
            [RelayEnvelope::Closed { message, .. }] => assert!(message.starts_with("rate-limited:")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.relay.metrics().rate_limit_hits.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn every_frame_counts_against_the_rate_limit() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 1;
        let mut h = Harness::new(config).await;

        h.send(r#"["CLOSE","nothing"]"#).await;
        assert!(h.drain().is_empty());

        h.send("not json").await;
        h.send(r#"["CLOSE","nothing"]"#).await;
        h.send(r#"["COUNT","c",{}]"#).await;
        let out = h.drain();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], RelayEnvelope::notice("rate-limited: too many messages on this connection"));
        assert!(matches!(&out[1], RelayEnvelope::Notice(m) if m.starts_with("rate-limited:")));
        assert!(matches!(&out[2], RelayEnvelope::Closed { message, .. } if message.starts_with("rate-limited:")));
        assert_eq!(h.relay.metrics().rate_limit_hits.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn privileged_backlog_needs_matching_identity() {
        let mut h = Harness::new(Config::default()).await;
        let alice = keys(1);
        let bob = keys(2);
        let dm = alice
            .sign(
                UnsignedEvent::new(kind::ENCRYPTED_DIRECT_MESSAGE, "", unix_now())
                    .tag(["p".to_string(), bob.public_key().to_hex()]),
            )
            .unwrap();
        h.send(&event_frame(&dm)).await;
        h.drain();

        h.send(r#"["REQ","dms",{"kinds":[4]}]"#).await;
        assert_eq!(h.drain(), vec![RelayEnvelope::Eose(SubscriptionId::new("dms"))]);

        h.session.set_authenticated(bob.public_key());
        let req = format!(
            r##"["REQ","dms2",{{"kinds":[4],"#p":["{}"]}}]"##,
            bob.public_key().to_hex()
        );
        h.send(&req).await;
        assert!(h.drain().contains(&RelayEnvelope::Event {
            subscription_id: SubscriptionId::new("dms2"),
            event: dm
        }));
    }
}
