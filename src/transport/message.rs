//! Wire protocol spoken over the WebSocket transport.
//!
//! Inbound frames are decoded into a permissive `ClientMessage` first so
//! that a missing field can be reported with a precise reason, then
//! validated into a `Request`. Outbound frames are `ServerMessage` values
//! tagged by `type`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Envelope, Message};
use crate::utils::error::ProtocolError;

/// An inbound frame as it appears on the wire, before validation.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ClientMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_n: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct MessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// JSON `null` deserializes to `None` and is rejected like a missing payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Publish {
        topic: String,
        message: Message,
    },
    Subscribe {
        topic: String,
        client_id: String,
        /// Number of historical events to replay; zero means none.
        last_n: usize,
    },
    Unsubscribe {
        topic: String,
        client_id: String,
    },
    Ping,
}

fn required(value: Option<String>, reason: &'static str) -> Result<String, ProtocolError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingField(reason))
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)
    }

    /// The correlation id to echo back, if the client sent a non-empty one.
    pub fn request_id(&self) -> Option<String> {
        self.request_id.clone().filter(|id| !id.is_empty())
    }

    pub fn into_request(self) -> Result<Request, ProtocolError> {
        match self.kind.as_str() {
            "publish" => {
                let topic = required(self.topic, "Topic is required for publish")?;
                let data = self
                    .message
                    .ok_or(ProtocolError::MissingField("Message is required for publish"))?;
                let id = required(data.id, "Message ID is required")?;
                let payload = data
                    .payload
                    .ok_or(ProtocolError::MissingField("Message payload is required"))?;
                Ok(Request::Publish {
                    topic,
                    message: Message { id, payload },
                })
            }
            "subscribe" => {
                let topic = required(self.topic, "Topic is required for subscribe")?;
                let client_id = required(self.client_id, "Client ID is required for subscribe")?;
                let last_n = self.last_n.unwrap_or(0).max(0) as usize;
                Ok(Request::Subscribe {
                    topic,
                    client_id,
                    last_n,
                })
            }
            "unsubscribe" => {
                let topic = required(self.topic, "Topic is required for unsubscribe")?;
                let client_id =
                    required(self.client_id, "Client ID is required for unsubscribe")?;
                Ok(Request::Unsubscribe { topic, client_id })
            }
            "ping" => Ok(Request::Ping),
            _ => Err(ProtocolError::UnknownType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    SlowConsumer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        topic: String,
        status: String,
        ts: String,
    },
    Event {
        topic: String,
        message: Message,
        ts: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: ErrorBody,
        ts: String,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        ts: String,
    },
    Info {
        msg: String,
        ts: String,
    },
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ServerMessage {
    pub fn ack(request_id: Option<String>, topic: impl Into<String>) -> Self {
        ServerMessage::Ack {
            request_id,
            topic: topic.into(),
            status: "ok".to_string(),
            ts: now(),
        }
    }

    /// Event frame carrying a published envelope, stamped with its publish time.
    pub fn event(envelope: &Envelope) -> Self {
        ServerMessage::Event {
            topic: envelope.topic.clone(),
            message: envelope.message.clone(),
            ts: envelope
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            error: ErrorBody {
                code,
                message: message.into(),
            },
            ts: now(),
        }
    }

    pub fn bad_request(request_id: Option<String>, err: &ProtocolError) -> Self {
        Self::error(request_id, ErrorCode::BadRequest, err.to_string())
    }

    pub fn slow_consumer() -> Self {
        Self::error(
            None,
            ErrorCode::SlowConsumer,
            "Client queue overflow, disconnecting",
        )
    }

    pub fn pong(request_id: Option<String>) -> Self {
        ServerMessage::Pong {
            request_id,
            ts: now(),
        }
    }

    pub fn info(msg: impl Into<String>) -> Self {
        ServerMessage::Info {
            msg: msg.into(),
            ts: now(),
        }
    }

    /// Encode as a text frame. Serialization failures are logged and yield `None`.
    pub fn to_frame(&self) -> Option<WsMessage> {
        match serde_json::to_string(self) {
            Ok(json) => Some(WsMessage::text(json)),
            Err(e) => {
                error!(error = %e, "failed to serialize server message");
                None
            }
        }
    }
}
