//! Message protocol definitions
//!
//! One JSON envelope for every message type:
//! `{ id, type, timestamp, data, requestId?, error? }`.
//!
//! Decoding is type-directed: the envelope is parsed first, then `data` is
//! parsed into the payload struct selected by `type`. This keeps `Payload`
//! a plain tagged union with strongly typed variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::types::MessageId;

/// Event name carried by notifications produced from client publishes
pub const PUBLISH_EVENT: &str = "publish";

/// The fixed message-type vocabulary (`type` field on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Auth,
    AuthResult,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    Publish,
    PublishAck,
    Notify,
    Error,
}

/// Liveness probe response, echoing the probe's timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of subscribe/unsubscribe requests and their acks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAckPayload {
    pub channel: String,
    pub subscriber_count: usize,
}

/// Server-pushed event on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be decoded
    InvalidMessage,
    /// Request needs an authenticated connection
    NotAuthenticated,
    /// Type is valid but not accepted from clients
    UnsupportedType,
    /// Connection vanished while the request was processed
    ConnectionNotFound,
    /// Second auth request on an authenticated connection
    AlreadyAuthenticated,
    /// Empty or oversized channel name
    InvalidChannel,
    Internal,
}

/// Typed payload, one variant per message type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping,
    Pong(PongPayload),
    Auth(AuthPayload),
    AuthResult(AuthResultPayload),
    Subscribe(ChannelPayload),
    SubscribeAck(ChannelPayload),
    Unsubscribe(ChannelPayload),
    UnsubscribeAck(ChannelPayload),
    Publish(PublishPayload),
    PublishAck(PublishAckPayload),
    Notify(NotifyPayload),
    Error(ErrorPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::Ping => MessageType::Ping,
            Payload::Pong(_) => MessageType::Pong,
            Payload::Auth(_) => MessageType::Auth,
            Payload::AuthResult(_) => MessageType::AuthResult,
            Payload::Subscribe(_) => MessageType::Subscribe,
            Payload::SubscribeAck(_) => MessageType::SubscribeAck,
            Payload::Unsubscribe(_) => MessageType::Unsubscribe,
            Payload::UnsubscribeAck(_) => MessageType::UnsubscribeAck,
            Payload::Publish(_) => MessageType::Publish,
            Payload::PublishAck(_) => MessageType::PublishAck,
            Payload::Notify(_) => MessageType::Notify,
            Payload::Error(_) => MessageType::Error,
        }
    }

    /// Parse `data` into the payload shape dictated by `kind`
    ///
    /// A missing `data` field is read as an empty object, so a bare
    /// `{"type":"ping"}` is accepted.
    pub fn from_data(kind: MessageType, data: Option<Value>) -> serde_json::Result<Self> {
        let data = data.unwrap_or_else(|| Value::Object(Default::default()));
        let payload = match kind {
            MessageType::Ping => Payload::Ping,
            MessageType::Pong => Payload::Pong(serde_json::from_value(data)?),
            MessageType::Auth => Payload::Auth(serde_json::from_value(data)?),
            MessageType::AuthResult => Payload::AuthResult(serde_json::from_value(data)?),
            MessageType::Subscribe => Payload::Subscribe(serde_json::from_value(data)?),
            MessageType::SubscribeAck => Payload::SubscribeAck(serde_json::from_value(data)?),
            MessageType::Unsubscribe => Payload::Unsubscribe(serde_json::from_value(data)?),
            MessageType::UnsubscribeAck => Payload::UnsubscribeAck(serde_json::from_value(data)?),
            MessageType::Publish => Payload::Publish(serde_json::from_value(data)?),
            MessageType::PublishAck => Payload::PublishAck(serde_json::from_value(data)?),
            MessageType::Notify => Payload::Notify(serde_json::from_value(data)?),
            MessageType::Error => Payload::Error(serde_json::from_value(data)?),
        };
        Ok(payload)
    }

    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Payload::Ping => Ok(Value::Object(Default::default())),
            Payload::Pong(p) => serde_json::to_value(p),
            Payload::Auth(p) => serde_json::to_value(p),
            Payload::AuthResult(p) => serde_json::to_value(p),
            Payload::Subscribe(p)
            | Payload::SubscribeAck(p)
            | Payload::Unsubscribe(p)
            | Payload::UnsubscribeAck(p) => serde_json::to_value(p),
            Payload::Publish(p) => serde_json::to_value(p),
            Payload::PublishAck(p) => serde_json::to_value(p),
            Payload::Notify(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
        }
    }
}

/// Wire form of the envelope, used on the way in
#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    id: Option<MessageId>,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Wire form of the envelope, used on the way out
#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    id: &'a MessageId,
    #[serde(rename = "type")]
    kind: MessageType,
    timestamp: &'a DateTime<Utc>,
    data: Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// A message exchanged over a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    /// Correlation id: on replies, the id of the request being answered
    pub request_id: Option<String>,
    pub error: Option<String>,
}

impl Message {
    /// Create a message with a fresh id and the current time
    pub fn new(payload: Payload) -> Self {
        let error = match &payload {
            Payload::Error(e) => Some(e.message.clone()),
            _ => None,
        };
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            payload,
            request_id: None,
            error,
        }
    }

    /// Create a reply correlated with `request`
    pub fn reply_to(request: &Message, payload: Payload) -> Self {
        Self::new(payload).with_request_id(request.id.0.clone())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(Payload::Error(ErrorPayload {
            code,
            message: message.into(),
        }))
    }

    pub fn notify(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self::new(Payload::Notify(NotifyPayload {
            channel: channel.into(),
            event: event.into(),
            data,
        }))
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    /// Serialize to the JSON wire envelope
    pub fn encode(&self) -> serde_json::Result<String> {
        let envelope = OutboundEnvelope {
            id: &self.id,
            kind: self.kind(),
            timestamp: &self.timestamp,
            data: self.payload.to_data()?,
            request_id: self.request_id.as_deref(),
            error: self.error.as_deref(),
        };
        serde_json::to_string(&envelope)
    }

    /// Parse a JSON wire envelope
    ///
    /// Inbound frames without an `id` get a freshly minted one.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        let envelope: InboundEnvelope = serde_json::from_slice(bytes)?;
        let payload = Payload::from_data(envelope.kind, envelope.data)?;
        Ok(Self {
            id: envelope.id.unwrap_or_default(),
            timestamp: envelope.timestamp,
            payload,
            request_id: envelope.request_id,
            error: envelope.error,
        })
    }
}

/// Convert HubError to an error payload for client notification
impl From<&HubError> for ErrorPayload {
    fn from(err: &HubError) -> Self {
        let code = match err {
            HubError::NotAuthenticated => ErrorCode::NotAuthenticated,
            HubError::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            HubError::ConnectionNotFound(_) => ErrorCode::ConnectionNotFound,
            HubError::InvalidChannel(_) => ErrorCode::InvalidChannel,
            HubError::Malformed(_) => ErrorCode::InvalidMessage,
            HubError::UnsupportedType(_) => ErrorCode::UnsupportedType,
            HubError::ConnectionClosed | HubError::SendChannelFull => ErrorCode::Internal,
        };
        ErrorPayload {
            code,
            message: err.to_string(),
        }
    }
}
