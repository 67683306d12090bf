//! # strand-relay
//!
//! Access-controlled publish/subscribe relay for signed events.
//!
//! Clients connect over WebSocket and exchange JSON envelopes:
//! - EVENT → OK (publish a signed event)
//! - REQ → EVENT* EOSE, then live EVENTs (subscribe)
//! - COUNT → COUNT (count matching events)
//! - CLOSE (end a subscription)
//! - AUTH (prove control of a key against the connection's challenge)
//!
//! ## Architecture
//!
//! ```text
//! client ──┐   WebSocket   ┌── client
//!          ├──────────────►│
//!      ┌───┴───────────────┴───┐
//!      │ session → protocol    │
//!      │    access → publish   │
//!      │    broker (fan-out)   │
//!      │  ┌─────────────────┐  │
//!      │  │ SQLite (events) │  │
//!      │  └─────────────────┘  │
//!      └───────────────────────┘
//! ```
//!
//! When owners are configured, writes are limited to the owners, the keys
//! they follow (up to `follow_depth` hops) and authenticated clients, and
//! owners' mute lists block authors outright.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod broker;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod publish;
pub mod server;
pub mod session;
pub mod storage;
