//! DDP wire protocol: JSON envelopes tagged by their `msg` field.
//!
//! ```text
//! client → server   connect  method  sub  unsub  ping  pong
//! server → client   connected  failed  result  nosub  ready  updated
//!                   added  changed  removed  ping  pong  error
//! ```
//!
//! Every envelope is one JSON object per transport frame. Unknown tags decode
//! to [`Message::Unrecognized`] so the router can log and drop them instead of
//! failing the whole frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DdpError, MethodError};

/// A document body: field name → value. `_id` is carried separately.
pub type Document = Map<String, Value>;

/// DDP versions this client can speak, most preferred first.
pub const SUPPORTED_DDP_VERSIONS: &[&str] = &["1", "pre2", "pre1"];

/// Top-level protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Message {
    Connect {
        version: String,
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(
            rename = "randomSeed",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    Ready {
        subs: Vec<String>,
    },
    Updated {
        methods: Vec<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Document>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
    /// Any `msg` tag this client does not know.
    #[serde(other)]
    Unrecognized,
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed envelope.
    Message(Message),
    /// The `{server_id}` frame (or a test-on-connect probe) sent before the
    /// DDP handshake; carries no protocol meaning.
    Handshake,
    /// Valid JSON that is not an envelope.
    Invalid(Value),
}

impl Message {
    /// Whether this envelope goes through the data path (and therefore the
    /// quiescence buffer).
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Added { .. }
                | Self::Changed { .. }
                | Self::Removed { .. }
                | Self::Ready { .. }
                | Self::Updated { .. }
                | Self::Nosub { .. }
        )
    }

    /// Plain document writes, which may be batched by the buffered-write timer.
    pub fn is_document_write(&self) -> bool {
        matches!(
            self,
            Self::Added { .. } | Self::Changed { .. } | Self::Removed { .. }
        )
    }

    /// The `msg` tag as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Method { .. } => "method",
            Self::Result { .. } => "result",
            Self::Sub { .. } => "sub",
            Self::Unsub { .. } => "unsub",
            Self::Nosub { .. } => "nosub",
            Self::Ready { .. } => "ready",
            Self::Updated { .. } => "updated",
            Self::Added { .. } => "added",
            Self::Changed { .. } => "changed",
            Self::Removed { .. } => "removed",
            Self::Error { .. } => "error",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, DdpError> {
        serde_json::to_string(self).map_err(|e| DdpError::Encode(e.to_string()))
    }

    /// Decode one wire frame.
    ///
    /// Malformed JSON and known tags with missing fields are errors; frames
    /// that parse as JSON but are not envelopes come back as
    /// [`Inbound::Handshake`] or [`Inbound::Invalid`].
    pub fn decode(raw: &str) -> Result<Inbound, DdpError> {
        let value: Value = serde_json::from_str(raw)?;

        let Some(object) = value.as_object() else {
            return Ok(Inbound::Invalid(value));
        };

        if !object.get("msg").is_some_and(Value::is_string) {
            let handshake = (object.len() == 1 && object.contains_key("server_id"))
                || object.contains_key("testMessageOnConnect");
            return Ok(if handshake {
                Inbound::Handshake
            } else {
                Inbound::Invalid(value)
            });
        }

        Ok(Inbound::Message(serde_json::from_value(value)?))
    }

    /// A `ping`, optionally tagged with an id the peer echoes back.
    pub fn ping(id: Option<String>) -> Self {
        Self::Ping { id }
    }

    /// Reply to a `ping`, echoing its id.
    pub fn pong(id: Option<String>) -> Self {
        Self::Pong { id }
    }

    /// Request publication `name` under subscription `id`.
    pub fn sub(id: impl Into<String>, name: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Sub {
            id: id.into(),
            name: name.into(),
            params,
        }
    }

    /// Stop subscription `id`.
    pub fn unsub(id: impl Into<String>) -> Self {
        Self::Unsub { id: id.into() }
    }

    /// A document entering the client's view of `collection`.
    pub fn added(collection: impl Into<String>, id: impl Into<String>, fields: Document) -> Self {
        Self::Added {
            collection: collection.into(),
            id: id.into(),
            fields: Some(fields),
        }
    }

    /// Field updates for an existing document. Empty `fields` or `cleared`
    /// are omitted from the frame.
    pub fn changed(
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Document,
        cleared: Vec<String>,
    ) -> Self {
        Self::Changed {
            collection: collection.into(),
            id: id.into(),
            fields: (!fields.is_empty()).then_some(fields),
            cleared: (!cleared.is_empty()).then_some(cleared),
        }
    }

    /// A document leaving the client's view.
    pub fn removed(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Removed {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// Build a document from `(key, value)` pairs.
pub fn document<K, I>(pairs: I) -> Document
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_message(raw: &str) -> Message {
        match Message::decode(raw).unwrap() {
            Inbound::Message(msg) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_wire_shape() {
        let msg = Message::Connect {
            version: "1".into(),
            support: vec!["1".into(), "pre2".into()],
            session: None,
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"msg": "connect", "version": "1", "support": ["1", "pre2"]}));
    }

    #[test]
    fn test_method_random_seed_only_when_present() {
        let without = Message::Method {
            id: "1".into(),
            method: "inc".into(),
            params: vec![json!(1)],
            random_seed: None,
        };
        assert!(!without.encode().unwrap().contains("randomSeed"));

        let with = Message::Method {
            id: "2".into(),
            method: "inc".into(),
            params: vec![],
            random_seed: Some("abc".into()),
        };
        let value: Value = serde_json::from_str(&with.encode().unwrap()).unwrap();
        assert_eq!(value["randomSeed"], json!("abc"));
    }

    #[test]
    fn test_decode_result_with_error() {
        let msg = decode_message(
            r#"{"msg":"result","id":"7","error":{"error":403,"reason":"Access denied"}}"#,
        );
        match msg {
            Message::Result { id, result, error } => {
                assert_eq!(id, "7");
                assert!(result.is_none());
                assert_eq!(error.unwrap().reason.as_deref(), Some("Access denied"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_changed_with_cleared() {
        let msg = decode_message(
            r#"{"msg":"changed","collection":"todos","id":"a","fields":{"done":true},"cleared":["tag"]}"#,
        );
        assert_eq!(
            msg,
            Message::Changed {
                collection: "todos".into(),
                id: "a".into(),
                fields: Some(document([("done", json!(true))])),
                cleared: Some(vec!["tag".into()]),
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_unrecognized() {
        assert_eq!(decode_message(r#"{"msg":"teleport","to":"mars"}"#), Message::Unrecognized);
    }

    #[test]
    fn test_server_id_frame_is_handshake() {
        assert_eq!(Message::decode(r#"{"server_id":"0"}"#).unwrap(), Inbound::Handshake);
        assert!(matches!(
            Message::decode(r#"{"server_id":"0","extra":1}"#).unwrap(),
            Inbound::Invalid(_)
        ));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(Message::decode("{not json").is_err());
        // Known tag with a missing required field.
        assert!(Message::decode(r#"{"msg":"ready"}"#).is_err());
    }

    #[test]
    fn test_data_classification() {
        assert!(Message::removed("c", "1").is_data());
        assert!(Message::removed("c", "1").is_document_write());
        assert!(Message::Ready { subs: vec![] }.is_data());
        assert!(!Message::Ready { subs: vec![] }.is_document_write());
        assert!(!Message::ping(None).is_data());
    }

    #[test]
    fn test_changed_constructor_omits_empty_parts() {
        let msg = Message::changed("c", "1", Document::new(), vec!["x".into()]);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert!(value.get("fields").is_none());
        assert_eq!(value["cleared"], json!(["x"]));
    }
}
