//! Per-connection session management.
//!
//! Each WebSocket connection gets a [`ConnectionSession`] holding its
//! authentication challenge and identity, and runs two workers: a reader
//! that handles inbound frames in order, and a writer that drains the
//! outbound queue and keeps the connection alive with pings.

use crate::broker::Outbound;
use crate::error::ProtocolError;
use crate::protocol;
use crate::server::Relay;
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use strand_types::{kind, Event, PublicKey, Reason, RelayEnvelope};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Relay-assigned connection number.
pub type ConnectionId = u64;

/// Authentication state of one connection.
#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    challenge: String,
    authed: OnceLock<PublicKey>,
    auth_requested: AtomicBool,
    remote: String,
}

impl ConnectionSession {
    /// Create a session with a fresh random challenge.
    pub fn new(id: ConnectionId, remote: impl Into<String>) -> Result<Self, ProtocolError> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).map_err(|e| ProtocolError::Entropy(e.to_string()))?;
        Ok(Self {
            id,
            challenge: URL_SAFE_NO_PAD.encode(bytes),
            authed: OnceLock::new(),
            auth_requested: AtomicBool::new(false),
            remote: remote.into(),
        })
    }

    /// Connection number.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Challenge the client must sign to authenticate.
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Remote address label for logs.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Authenticated identity, if any.
    pub fn authed(&self) -> Option<&PublicKey> {
        self.authed.get()
    }

    /// Whether the relay has asked this client to authenticate.
    pub fn auth_requested(&self) -> bool {
        self.auth_requested.load(Ordering::Relaxed)
    }

    /// Record that an AUTH challenge was sent.
    pub fn mark_auth_requested(&self) {
        self.auth_requested.store(true, Ordering::Relaxed);
    }

    /// Bind the connection to `pubkey`. The first identity sticks.
    pub fn set_authenticated(&self, pubkey: PublicKey) -> bool {
        self.authed.set(pubkey).is_ok() || self.authed.get() == Some(&pubkey)
    }

    /// Check an AUTH response and bind the connection to its author.
    ///
    /// `relay_url`, when set, must match the event's `relay` tag.
    pub fn authenticate(
        &self,
        event: &Event,
        relay_url: Option<&str>,
        window_secs: u64,
        now: u64,
    ) -> Result<PublicKey, Reason> {
        if event.kind != kind::CLIENT_AUTHENTICATION {
            return Err(Reason::invalid("auth event has the wrong kind"));
        }
        if event.created_at.abs_diff(now) > window_secs {
            return Err(Reason::invalid("auth event is too far from the current time"));
        }
        if event.tag_values("challenge").next() != Some(self.challenge.as_str()) {
            return Err(Reason::invalid("challenge does not match"));
        }
        if let Some(expected) = relay_url {
            let matches = event
                .tag_values("relay")
                .next()
                .is_some_and(|url| same_relay_url(url, expected));
            if !matches {
                return Err(Reason::invalid("relay url does not match"));
            }
        }
        event.verify().map_err(|e| Reason::invalid(e.to_string()))?;

        if !self.set_authenticated(event.pubkey) {
            return Err(Reason::restricted(
                "connection is already authenticated as another key",
            ));
        }
        Ok(event.pubkey)
    }
}

/// Compare relay URLs ignoring case and a trailing slash.
fn same_relay_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Send the session's challenge and remember that we asked.
pub async fn request_auth(session: &ConnectionSession, outbound: &Outbound) {
    session.mark_auth_requested();
    outbound
        .send(RelayEnvelope::Auth {
            challenge: session.challenge().to_string(),
        })
        .await;
}

/// Run a WebSocket connection until it closes.
///
/// Frames are handled one at a time in arrival order, and a frame that
/// has started is always finished, even if the socket closes meanwhile.
pub async fn run(relay: Arc<Relay>, socket: WebSocket, remote: SocketAddr) {
    let session = match relay.open_session(remote.to_string()) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            tracing::error!("Could not open session for {}: {}", remote, e);
            return;
        }
    };
    let id = session.id();
    tracing::info!("New connection {} from {}", id, remote);

    let (outbound, rx) = Outbound::channel(relay.config().limits.outbound_queue);
    let closing = outbound.closing().clone();
    relay.broker().register(session.clone(), outbound.clone()).await;

    let (sink, mut stream) = socket.split();
    let started = Instant::now();
    // The connect instant counts as the first pong
    let last_pong = Arc::new(AtomicU64::new(0));
    let keepalive = Keepalive {
        started,
        last_pong: last_pong.clone(),
        interval: Duration::from_secs(relay.config().limits.ping_interval_secs),
        timeout: Duration::from_secs(relay.config().limits.pong_timeout_secs),
    };
    let writer = tokio::spawn(write_loop(sink, rx, closing.clone(), keepalive));

    if relay.access().is_restricted() {
        request_auth(&session, &outbound).await;
    }

    loop {
        let frame = tokio::select! {
            _ = closing.cancelled() => break,
            frame = stream.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Pong(_))) => {
                last_pong.store(elapsed_ms(started), Ordering::Relaxed);
                continue;
            }
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::warn!("Connection {} read error: {}", id, ProtocolError::from(e));
                break;
            }
        };

        protocol::handle_frame(&relay, &session, &outbound, &bytes).await;
    }

    closing.cancel();
    relay.broker().remove_connection(id).await;
    let _ = writer.await;
    tracing::info!("Connection {} from {} closed", id, remote);
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Ping schedule for one connection.
struct Keepalive {
    started: Instant,
    /// Milliseconds after `started` of the latest pong.
    last_pong: Arc<AtomicU64>,
    interval: Duration,
    timeout: Duration,
}

/// Whether the oldest unanswered ping has waited longer than `timeout_ms`.
fn pong_overdue(unanswered_since: Option<u64>, last_pong: u64, now: u64, timeout_ms: u64) -> bool {
    match unanswered_since {
        Some(sent) if last_pong < sent => now.saturating_sub(sent) > timeout_ms,
        _ => false,
    }
}

/// Drain the outbound queue into the socket and send keepalive pings.
///
/// A write that stalls for longer than the pong timeout ends the connection.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<RelayEnvelope>,
    closing: CancellationToken,
    keepalive: Keepalive,
) {
    let timeout_ms = u64::try_from(keepalive.timeout.as_millis()).unwrap_or(u64::MAX);
    let mut ping = interval(keepalive.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;
    let mut unanswered_since: Option<u64> = None;

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let write = sink.send(Message::Text(envelope.to_json()));
                match tokio::time::timeout(keepalive.timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("Write failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("Write stalled for {:?}, dropping connection", keepalive.timeout);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let now = elapsed_ms(keepalive.started);
                let last_pong = keepalive.last_pong.load(Ordering::Relaxed);
                if pong_overdue(unanswered_since, last_pong, now, timeout_ms) {
                    tracing::warn!("{}", ProtocolError::PongTimeout(keepalive.timeout.as_secs()));
                    break;
                }
                if unanswered_since.map_or(true, |sent| last_pong >= sent) {
                    unanswered_since = Some(now);
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    closing.cancel();
    let _ = sink.close().await;
}
