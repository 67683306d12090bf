//! Envelopes - the labeled JSON arrays framing every client/relay message.
//!
//! Every frame is `[label, ...fields]`. Decoding reads the label first and
//! then parses only the positional fields that label defines; any extra
//! element is rejected as trailing data except for the variable-length
//! filter tail of `REQ` and `COUNT`.
//!
//! Some labels are shared by both directions with different payloads
//! (`EVENT`, `AUTH`, `COUNT`). The direction, not the wire content, picks
//! the variant, so the two directions have separate types:
//! [`ClientEnvelope`] (client to relay) and [`RelayEnvelope`] (relay to client).

use serde::de::DeserializeOwned;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;

use crate::{EnvelopeError, Event, EventId, Filter, FilterSet, SubscriptionId};

/// Envelope label discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Event submission or delivery
    Event,
    /// Open a subscription
    Req,
    /// Close a subscription
    Close,
    /// Relay-initiated subscription close
    Closed,
    /// End of stored events
    Eose,
    /// Count request or response
    Count,
    /// Human-readable relay message
    Notice,
    /// Result of an event submission
    Ok,
    /// Authentication challenge or response
    Auth,
}

impl Label {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Req => "REQ",
            Self::Close => "CLOSE",
            Self::Closed => "CLOSED",
            Self::Eose => "EOSE",
            Self::Count => "COUNT",
            Self::Notice => "NOTICE",
            Self::Ok => "OK",
            Self::Auth => "AUTH",
        }
    }
}

impl FromStr for Label {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "EVENT" => Self::Event,
            "REQ" => Self::Req,
            "CLOSE" => Self::Close,
            "CLOSED" => Self::Closed,
            "EOSE" => Self::Eose,
            "COUNT" => Self::Count,
            "NOTICE" => Self::Notice,
            "OK" => Self::Ok,
            "AUTH" => Self::Auth,
            other => return Err(EnvelopeError::UnknownLabel(other.to_string())),
        })
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a COUNT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    /// Number of matching events
    pub count: u64,
    /// Whether the count is an estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate: Option<bool>,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEnvelope {
    /// `["EVENT", event]` - submit an event
    Event(Event),
    /// `["REQ", sub_id, filter, ...]` - open a subscription
    Req {
        /// Client-chosen subscription id
        subscription_id: SubscriptionId,
        /// Filters, OR-ed together
        filters: FilterSet,
    },
    /// `["COUNT", sub_id, filter, ...]` - count matching events
    Count {
        /// Client-chosen request id
        subscription_id: SubscriptionId,
        /// Filters, OR-ed together
        filters: FilterSet,
    },
    /// `["CLOSE", sub_id]` - close a subscription
    Close(SubscriptionId),
    /// `["AUTH", event]` - answer an authentication challenge
    Auth(Event),
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnvelope {
    /// `["EVENT", sub_id, event]` - deliver an event to a subscription
    Event {
        /// Subscription the event matched
        subscription_id: SubscriptionId,
        /// The event
        event: Event,
    },
    /// `["OK", event_id, accepted, reason]` - result of a submission
    Ok {
        /// Submitted event id
        event_id: EventId,
        /// Whether it was accepted
        accepted: bool,
        /// Prefixed reason, possibly empty
        message: String,
    },
    /// `["EOSE", sub_id]` - stored events exhausted
    Eose(SubscriptionId),
    /// `["CLOSED", sub_id, reason]` - subscription ended by the relay
    Closed {
        /// Subscription being closed
        subscription_id: SubscriptionId,
        /// Prefixed reason
        message: String,
    },
    /// `["NOTICE", message]` - human-readable message
    Notice(String),
    /// `["AUTH", challenge]` - authentication challenge
    Auth {
        /// Opaque challenge string
        challenge: String,
    },
    /// `["COUNT", sub_id, {"count": n}]` - count result
    Count {
        /// Request id
        subscription_id: SubscriptionId,
        /// Count payload
        result: CountResult,
    },
}

impl ClientEnvelope {
    /// Label of this envelope.
    pub fn label(&self) -> Label {
        match self {
            Self::Event(_) => Label::Event,
            Self::Req { .. } => Label::Req,
            Self::Count { .. } => Label::Count,
            Self::Close(_) => Label::Close,
            Self::Auth(_) => Label::Auth,
        }
    }

    /// Decode a client frame.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut fields = Fields::parse(bytes)?;
        let envelope = match fields.label {
            Label::Event => Self::Event(fields.next("event")?),
            Label::Req => {
                let subscription_id = fields.subscription_id()?;
                let filters = fields.filter_tail()?;
                Self::Req {
                    subscription_id,
                    filters,
                }
            }
            Label::Count => {
                let subscription_id = fields.subscription_id()?;
                let filters = fields.filter_tail()?;
                Self::Count {
                    subscription_id,
                    filters,
                }
            }
            Label::Close => Self::Close(fields.subscription_id()?),
            Label::Auth => Self::Auth(fields.next("event")?),
            other => {
                return Err(EnvelopeError::Malformed(format!(
                    "{other} is not a client message"
                )))
            }
        };
        fields.finish()?;
        Ok(envelope)
    }

    /// Encode as compact JSON.
    pub fn to_json(&self) -> String {
        encode(self)
    }
}

impl RelayEnvelope {
    /// Label of this envelope.
    pub fn label(&self) -> Label {
        match self {
            Self::Event { .. } => Label::Event,
            Self::Ok { .. } => Label::Ok,
            Self::Eose(_) => Label::Eose,
            Self::Closed { .. } => Label::Closed,
            Self::Notice(_) => Label::Notice,
            Self::Auth { .. } => Label::Auth,
            Self::Count { .. } => Label::Count,
        }
    }

    /// Decode a relay frame.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut fields = Fields::parse(bytes)?;
        let envelope = match fields.label {
            Label::Event => Self::Event {
                subscription_id: fields.next("subscription id")?,
                event: fields.next("event")?,
            },
            Label::Ok => Self::Ok {
                event_id: fields.next("event id")?,
                accepted: fields.next("accepted flag")?,
                message: fields.next("message")?,
            },
            Label::Eose => Self::Eose(fields.next("subscription id")?),
            Label::Closed => Self::Closed {
                subscription_id: fields.next("subscription id")?,
                message: fields.next("message")?,
            },
            Label::Notice => Self::Notice(fields.next("message")?),
            Label::Auth => Self::Auth {
                challenge: fields.next("challenge")?,
            },
            Label::Count => Self::Count {
                subscription_id: fields.next("subscription id")?,
                result: fields.next("count")?,
            },
            other => {
                return Err(EnvelopeError::Malformed(format!(
                    "{other} is not a relay message"
                )))
            }
        };
        fields.finish()?;
        Ok(envelope)
    }

    /// Encode as compact JSON.
    pub fn to_json(&self) -> String {
        encode(self)
    }

    /// Shorthand for a NOTICE.
    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice(message.into())
    }

    /// Shorthand for a CLOSED.
    pub fn closed(subscription_id: SubscriptionId, message: impl Into<String>) -> Self {
        Self::Closed {
            subscription_id,
            message: message.into(),
        }
    }

    /// Shorthand for an OK.
    pub fn ok(event_id: EventId, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id,
            accepted,
            message: message.into(),
        }
    }
}

impl Serialize for ClientEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.label().as_str())?;
        match self {
            Self::Event(event) | Self::Auth(event) => seq.serialize_element(event)?,
            Self::Req {
                subscription_id,
                filters,
            }
            | Self::Count {
                subscription_id,
                filters,
            } => {
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
            }
            Self::Close(subscription_id) => seq.serialize_element(subscription_id)?,
        }
        seq.end()
    }
}

impl Serialize for RelayEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.label().as_str())?;
        match self {
            Self::Event {
                subscription_id,
                event,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event)?;
            }
            Self::Ok {
                event_id,
                accepted,
                message,
            } => {
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
            }
            Self::Eose(subscription_id) => seq.serialize_element(subscription_id)?,
            Self::Closed {
                subscription_id,
                message,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(message)?;
            }
            Self::Notice(message) => seq.serialize_element(message)?,
            Self::Auth { challenge } => seq.serialize_element(challenge)?,
            Self::Count {
                subscription_id,
                result,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(result)?;
            }
        }
        seq.end()
    }
}

/// Serialize an envelope; all payloads are plain JSON data.
fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Positional field reader over a decoded frame.
struct Fields<'a> {
    label: Label,
    items: std::vec::IntoIter<&'a RawValue>,
}

impl<'a> Fields<'a> {
    /// Split a frame into its label and raw remaining elements.
    fn parse(bytes: &'a [u8]) -> Result<Self, EnvelopeError> {
        let items: Vec<&'a RawValue> = serde_json::from_slice(bytes).map_err(|e| {
            if e.is_data() {
                EnvelopeError::Malformed("envelope must be a JSON array".into())
            } else {
                EnvelopeError::Json(e)
            }
        })?;
        let mut items = items.into_iter();
        let raw_label = items.next().ok_or(EnvelopeError::MissingLabel)?;
        let label: &str = serde_json::from_str(raw_label.get())
            .map_err(|_| EnvelopeError::Malformed("label must be a string".into()))?;
        Ok(Self {
            label: label.parse()?,
            items,
        })
    }

    fn next<T: DeserializeOwned>(&mut self, field: &'static str) -> Result<T, EnvelopeError> {
        let label = self.label.as_str();
        let raw = self
            .items
            .next()
            .ok_or(EnvelopeError::MissingField { label, field })?;
        serde_json::from_str(raw.get()).map_err(|e| EnvelopeError::InvalidField {
            label,
            field,
            reason: e.to_string(),
        })
    }

    fn subscription_id(&mut self) -> Result<SubscriptionId, EnvelopeError> {
        let id: SubscriptionId = self.next("subscription id")?;
        if !id.is_valid() {
            return Err(EnvelopeError::InvalidField {
                label: self.label.as_str(),
                field: "subscription id",
                reason: "must be 1 to 64 characters".into(),
            });
        }
        Ok(id)
    }

    /// Consume every remaining element as a filter; at least one is required.
    fn filter_tail(&mut self) -> Result<FilterSet, EnvelopeError> {
        let mut filters = vec![self.next::<Filter>("filter")?];
        while self.items.len() > 0 {
            filters.push(self.next("filter")?);
        }
        Ok(FilterSet::new(filters))
    }

    fn finish(mut self) -> Result<(), EnvelopeError> {
        match self.items.next() {
            Some(_) => Err(EnvelopeError::TrailingData {
                label: self.label.as_str(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, PublicKey, Signature, Tag};
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;

    fn sample_event() -> Event {
        Event {
            id: EventId::new([1; 32]),
            pubkey: PublicKey::new([2; 32]),
            created_at: 1_700_000_000,
            kind: Kind(1),
            tags: vec![Tag::new(["p", "abc"])],
            content: "hello".into(),
            sig: Signature::new([3; 64]),
        }
    }

    #[test]
    fn decode_close() {
        let env = ClientEnvelope::from_json(br#"["CLOSE","sub1"]"#).unwrap();
        assert_eq!(env, ClientEnvelope::Close("sub1".into()));
    }

    #[test]
    fn close_with_extra_field_is_trailing_data() {
        let err = ClientEnvelope::from_json(br#"["CLOSE","sub1","extra"]"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::TrailingData { label: "CLOSE" }));
    }

    #[test]
    fn event_with_extra_field_is_trailing_data() {
        let json = format!(r#"["EVENT",{},1]"#, sample_event().to_json());
        assert!(matches!(
            ClientEnvelope::from_json(json.as_bytes()),
            Err(EnvelopeError::TrailingData { .. })
        ));
    }

    #[test]
    fn req_accepts_many_filters() {
        let env = ClientEnvelope::from_json(br#"["REQ","s",{"kinds":[1]},{"limit":2}]"#).unwrap();
        match env {
            ClientEnvelope::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id.as_str(), "s");
                assert_eq!(filters.len(), 2);
            }
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[test]
    fn req_requires_a_filter() {
        assert!(matches!(
            ClientEnvelope::from_json(br#"["REQ","s"]"#),
            Err(EnvelopeError::MissingField { field: "filter", .. })
        ));
    }

    #[test]
    fn req_rejects_overlong_subscription_id() {
        let json = format!(r#"["REQ","{}",{{}}]"#, "x".repeat(65));
        assert!(matches!(
            ClientEnvelope::from_json(json.as_bytes()),
            Err(EnvelopeError::InvalidField { .. })
        ));
    }

    #[test]
    fn unknown_label_and_garbage() {
        assert!(matches!(
            ClientEnvelope::from_json(br#"["HELLO"]"#),
            Err(EnvelopeError::UnknownLabel(_))
        ));
        assert!(matches!(
            ClientEnvelope::from_json(br#"[]"#),
            Err(EnvelopeError::MissingLabel)
        ));
        assert!(ClientEnvelope::from_json(b"not json").is_err());
        assert!(ClientEnvelope::from_json(b"{}").is_err());
        assert!(ClientEnvelope::from_json(br#"["CLOSE","a"] x"#).is_err());
    }

    #[test]
    fn relay_labels_are_not_client_messages() {
        assert!(matches!(
            ClientEnvelope::from_json(br#"["EOSE","s"]"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            RelayEnvelope::from_json(br#"["REQ","s",{}]"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn ok_encoding_is_stable() {
        let env = RelayEnvelope::ok(EventId::new([0; 32]), false, "invalid: bad");
        assert_eq!(
            env.to_json(),
            format!(r#"["OK","{}",false,"invalid: bad"]"#, "00".repeat(32))
        );
    }

    #[test]
    fn count_response_omits_absent_approximate() {
        let env = RelayEnvelope::Count {
            subscription_id: "c".into(),
            result: CountResult {
                count: 3,
                approximate: None,
            },
        };
        assert_eq!(env.to_json(), r#"["COUNT","c",{"count":3}]"#);
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (
            any::<[u8; 32]>(),
            any::<[u8; 32]>(),
            any::<u64>(),
            any::<u16>(),
            vec(vec("[a-z0-9:]{0,8}", 1..4), 0..4),
            ".{0,32}",
            vec(any::<u8>(), 64),
        )
            .prop_map(|(id, pk, created_at, kind, tags, content, sig)| Event {
                id: EventId::new(id),
                pubkey: PublicKey::new(pk),
                created_at,
                kind: Kind(kind),
                tags: tags.into_iter().map(Tag).collect(),
                content,
                sig: Signature::from_bytes(&sig).unwrap(),
            })
    }

    fn arb_sub_id() -> impl Strategy<Value = SubscriptionId> {
        "[a-zA-Z0-9_:-]{1,64}".prop_map(SubscriptionId::new)
    }

    fn arb_filter() -> impl Strategy<Value = Filter> {
        (
            proptest::option::of(vec(any::<[u8; 32]>(), 0..3)),
            proptest::option::of(vec(any::<[u8; 32]>(), 0..3)),
            proptest::option::of(vec(any::<u16>(), 0..3)),
            btree_map(proptest::char::range('a', 'z'), vec("[a-z0-9]{0,6}", 0..3), 0..3),
            proptest::option::of(any::<u64>()),
            proptest::option::of(any::<u64>()),
            proptest::option::of(0u64..10_000),
        )
            .prop_map(|(ids, authors, kinds, tags, since, until, limit)| Filter {
                ids: ids.map(|v| v.into_iter().map(EventId::new).collect()),
                authors: authors.map(|v| v.into_iter().map(PublicKey::new).collect()),
                kinds: kinds.map(|v| v.into_iter().map(Kind).collect()),
                tags,
                since,
                until,
                limit,
            })
    }

    fn arb_filters() -> impl Strategy<Value = FilterSet> {
        vec(arb_filter(), 1..4).prop_map(FilterSet::new)
    }

    fn arb_client() -> impl Strategy<Value = ClientEnvelope> {
        prop_oneof![
            arb_event().prop_map(ClientEnvelope::Event),
            (arb_sub_id(), arb_filters()).prop_map(|(subscription_id, filters)| {
                ClientEnvelope::Req {
                    subscription_id,
                    filters,
                }
            }),
            (arb_sub_id(), arb_filters()).prop_map(|(subscription_id, filters)| {
                ClientEnvelope::Count {
                    subscription_id,
                    filters,
                }
            }),
            arb_sub_id().prop_map(ClientEnvelope::Close),
            arb_event().prop_map(ClientEnvelope::Auth),
        ]
    }

    fn arb_relay() -> impl Strategy<Value = RelayEnvelope> {
        prop_oneof![
            (arb_sub_id(), arb_event()).prop_map(|(subscription_id, event)| {
                RelayEnvelope::Event {
                    subscription_id,
                    event,
                }
            }),
            (any::<[u8; 32]>(), any::<bool>(), ".{0,40}").prop_map(|(id, accepted, message)| {
                RelayEnvelope::Ok {
                    event_id: EventId::new(id),
                    accepted,
                    message,
                }
            }),
            arb_sub_id().prop_map(RelayEnvelope::Eose),
            (arb_sub_id(), ".{0,40}").prop_map(|(subscription_id, message)| {
                RelayEnvelope::Closed {
                    subscription_id,
                    message,
                }
            }),
            ".{0,40}".prop_map(RelayEnvelope::Notice),
            "[A-Za-z0-9_-]{0,40}".prop_map(|challenge| RelayEnvelope::Auth { challenge }),
            (arb_sub_id(), any::<u64>(), proptest::option::of(any::<bool>())).prop_map(
                |(subscription_id, count, approximate)| RelayEnvelope::Count {
                    subscription_id,
                    result: CountResult { count, approximate },
                }
            ),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        #[test]
        fn client_envelope_roundtrip(env in arb_client()) {
            let json = env.to_json();
            let decoded = ClientEnvelope::from_json(json.as_bytes()).unwrap();
            prop_assert_eq!(&decoded, &env);
            prop_assert_eq!(decoded.to_json(), json);
        }

        #[test]
        fn relay_envelope_roundtrip(env in arb_relay()) {
            let json = env.to_json();
            let decoded = RelayEnvelope::from_json(json.as_bytes()).unwrap();
            prop_assert_eq!(&decoded, &env);
            prop_assert_eq!(decoded.to_json(), json);
        }
    }
}
