//! Wire protocol for the chat relay
//!
//! Every frame carries a JSON envelope `{ "type": <int>, "data": ... }`.
//! Requests travel client → server, deliveries server → client. Both are
//! decoded exactly once into a closed sum type by looking at the `type`
//! discriminant, so callers only ever match on typed payloads.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of an authenticated user, supplied by the identity service.
    UserId
);
string_id!(
    /// Identity of a chat, allocated by the store.
    ChatId
);
string_id!(MessageId);

impl ChatId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Errors produced while decoding envelopes
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown request type {0}")]
    UnknownRequestType(u8),

    #[error("unknown delivery type {0}")]
    UnknownDeliveryType(u8),

    #[error("unknown message type {0}")]
    UnknownMessageKind(u8),
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "msg_id")]
    pub id: MessageId,
    pub body: String,
    #[serde(rename = "t_date")]
    pub sent_at: DateTime<Utc>,
    pub from_id: UserId,
}

impl Message {
    pub fn new(body: impl Into<String>, from_id: UserId) -> Self {
        Self {
            id: MessageId::generate(),
            body: body.into(),
            sent_at: Utc::now(),
            from_id,
        }
    }
}

/// Operation carried by a NewMessage request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    Add,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Add),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Add => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageRequest {
    pub ch_id: ChatId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub msg: String,
}

/// Client → server envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    NewChat(NewChatRequest),
    NewMessage(NewMessageRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelivery {
    pub message: Message,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub ch_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Server → client envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    NewChat(ChatId),
    NewMessage(MessageDelivery),
    Error(ErrorBody),
}

/// Outer shape shared by requests and deliveries.
#[derive(Serialize, Deserialize)]
struct RawEnvelope<T> {
    #[serde(rename = "type")]
    kind: u8,
    data: T,
}

impl Request {
    pub const NEW_CHAT: u8 = 0;
    pub const NEW_MESSAGE: u8 = 1;

    /// Decode a request frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope<serde_json::Value> = serde_json::from_slice(bytes)?;
        Self::from_raw(raw)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_raw(raw: RawEnvelope<serde_json::Value>) -> Result<Self, ProtocolError> {
        match raw.kind {
            Self::NEW_CHAT => Ok(Request::NewChat(serde_json::from_value(raw.data)?)),
            Self::NEW_MESSAGE => Ok(Request::NewMessage(serde_json::from_value(raw.data)?)),
            other => Err(ProtocolError::UnknownRequestType(other)),
        }
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Request::NewChat(data) => RawEnvelope {
                kind: Self::NEW_CHAT,
                data,
            }
            .serialize(serializer),
            Request::NewMessage(data) => RawEnvelope {
                kind: Self::NEW_MESSAGE,
                data,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::<serde_json::Value>::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(D::Error::custom)
    }
}

impl Delivery {
    pub const NEW_CHAT: u8 = 0;
    pub const NEW_MESSAGE: u8 = 1;
    pub const ERROR: u8 = 2;

    pub fn error(err: impl fmt::Display) -> Self {
        Delivery::Error(ErrorBody {
            error: err.to_string(),
        })
    }

    /// Decode a delivery frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope<serde_json::Value> = serde_json::from_slice(bytes)?;
        Self::from_raw(raw)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_raw(raw: RawEnvelope<serde_json::Value>) -> Result<Self, ProtocolError> {
        match raw.kind {
            Self::NEW_CHAT => Ok(Delivery::NewChat(serde_json::from_value(raw.data)?)),
            Self::NEW_MESSAGE => Ok(Delivery::NewMessage(serde_json::from_value(raw.data)?)),
            Self::ERROR => Ok(Delivery::Error(serde_json::from_value(raw.data)?)),
            other => Err(ProtocolError::UnknownDeliveryType(other)),
        }
    }
}

impl Serialize for Delivery {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Delivery::NewChat(data) => RawEnvelope {
                kind: Self::NEW_CHAT,
                data,
            }
            .serialize(serializer),
            Delivery::NewMessage(data) => RawEnvelope {
                kind: Self::NEW_MESSAGE,
                data,
            }
            .serialize(serializer),
            Delivery::Error(data) => RawEnvelope {
                kind: Self::ERROR,
                data,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Delivery {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::<serde_json::Value>::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_new_chat_request() {
        let frame = br#"{"type":0,"data":{"user_ids":["bob","carol"]}}"#;
        let req = Request::from_slice(frame).unwrap();
        assert_eq!(
            req,
            Request::NewChat(NewChatRequest {
                user_ids: vec![UserId::from("bob"), UserId::from("carol")],
            })
        );
    }

    #[test]
    fn decodes_new_message_request_with_data_first() {
        let frame = br#"{"data":{"ch_id":"c1","type":0,"msg":"hi"},"type":1}"#;
        match Request::from_slice(frame).unwrap() {
            Request::NewMessage(msg) => {
                assert_eq!(msg.ch_id, ChatId::from("c1"));
                assert_eq!(msg.kind, MessageKind::Add);
                assert_eq!(msg.msg, "hi");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_request_type() {
        let err = Request::from_slice(br#"{"type":9,"data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRequestType(9)));
    }

    #[test]
    fn rejects_payload_that_does_not_match_type() {
        let err = Request::from_slice(br#"{"type":1,"data":{"user_ids":[]}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn rejects_unknown_message_kind() {
        let err =
            Request::from_slice(br#"{"type":1,"data":{"ch_id":"c","type":5,"msg":"x"}}"#)
                .unwrap_err();
        assert!(err.to_string().contains("unknown message type 5"));
    }

    #[test]
    fn new_chat_delivery_carries_bare_id() {
        let value = serde_json::to_value(Delivery::NewChat(ChatId::from("c42"))).unwrap();
        assert_eq!(value, json!({ "type": 0, "data": "c42" }));
    }

    #[test]
    fn error_delivery_shape() {
        let value = serde_json::to_value(Delivery::error("chat x not found")).unwrap();
        assert_eq!(
            value,
            json!({ "type": 2, "data": { "error": "chat x not found" } })
        );
    }

    #[test]
    fn message_delivery_uses_wire_field_names() {
        let message = Message::new("hello", UserId::from("alice"));
        let delivery = Delivery::NewMessage(MessageDelivery {
            message: message.clone(),
            kind: MessageKind::Add,
            ch_id: ChatId::from("c1"),
        });
        let value = serde_json::to_value(&delivery).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["data"]["ch_id"], "c1");
        assert_eq!(value["data"]["type"], 0);
        assert_eq!(value["data"]["message"]["body"], "hello");
        assert_eq!(value["data"]["message"]["from_id"], "alice");
        assert_eq!(value["data"]["message"]["msg_id"], message.id.as_str());
        assert!(value["data"]["message"]["t_date"].is_string());
    }

    #[test]
    fn delivery_decodes_by_discriminant() {
        let error = Delivery::from_slice(br#"{"type":2,"data":{"error":"boom"}}"#).unwrap();
        assert_eq!(
            error,
            Delivery::Error(ErrorBody {
                error: "boom".into()
            })
        );

        let chat = Delivery::from_slice(br#"{"type":0,"data":"abc"}"#).unwrap();
        assert_eq!(chat, Delivery::NewChat(ChatId::from("abc")));

        let err = Delivery::from_slice(br#"{"type":7,"data":null}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownDeliveryType(7)));
    }
}
