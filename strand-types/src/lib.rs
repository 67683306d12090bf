//! # strand-types
//!
//! Wire format types for the strand event relay.
//!
//! This crate provides the foundational types shared by the relay and its clients:
//! - [`EventId`], [`PublicKey`], [`Signature`] - Identity types
//! - [`Event`], [`Tag`], [`Kind`] - The signed, immutable event record
//! - [`Filter`], [`FilterSet`] - Subscription match criteria
//! - [`ClientEnvelope`], [`RelayEnvelope`] - Labeled wire messages
//! - [`Reason`] - Machine-readable rejection reasons
//! - [`EnvelopeError`], [`EventError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod event;
mod filter;
mod ids;
pub mod kind;
mod reason;
mod tag;

pub use envelope::{ClientEnvelope, CountResult, Label, RelayEnvelope};
pub use error::{EnvelopeError, EventError};
pub use event::{Event, Keys, UnsignedEvent};
pub use filter::{sort_newest_first, Filter, FilterSet};
pub use ids::{EventId, PublicKey, Signature, SubscriptionId};
pub use kind::Kind;
pub use reason::{Reason, ReasonPrefix};
pub use tag::Tag;
