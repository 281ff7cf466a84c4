//! Wire events exchanged with clients and between relay instances.
//!
//! Client frames carry an [`Event`]. The `type` field is kept as the raw
//! string so that an unrecognized kind still decodes: a frame that fails to
//! parse is a recoverable decode error, while a well-formed frame with an
//! unknown kind is a protocol violation the router rejects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::UserId;

/// Errors produced while decoding inbound frames or broker messages.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes were not valid JSON for the expected shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// A binary frame did not contain UTF-8 text.
    #[error("binary frame is not valid UTF-8 ({len} bytes)")]
    NotUtf8 {
        /// Frame length in bytes.
        len: usize,
    },
}

/// Recognized event kinds.
///
/// Only [`EventKind::SendMessage`] is deliverable. The other kinds exist in
/// the client protocol but carry no routing behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A chat message addressed to another user.
    SendMessage,
    /// Server-to-client notification of a new message.
    NewMessage,
    /// Room switch request.
    ChangeRoom,
}

impl EventKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::NewMessage => "new_message",
            Self::ChangeRoom => "change_room",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`EventKind::from_str`] for names outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(Self::SendMessage),
            "new_message" => Ok(Self::NewMessage),
            "change_room" => Ok(Self::ChangeRoom),
            other => Err(UnknownEventKind(other.to_owned())),
        }
    }
}

/// A client event frame: `{"type","from","to","payload"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Raw event kind as sent by the client.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sender.
    pub from: UserId,
    /// Recipient.
    pub to: UserId,
    /// Opaque message body, never interpreted by the relay.
    pub payload: String,
}

impl Event {
    /// Build a `send_message` event.
    pub fn send_message(
        from: impl Into<UserId>,
        to: impl Into<UserId>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            event_type: EventKind::SendMessage.as_str().to_owned(),
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame that is expected to carry UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text =
            std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8 { len: bytes.len() })?;
        Self::decode(text)
    }

    /// Parse the event kind against the closed set.
    pub fn kind(&self) -> Result<EventKind, UnknownEventKind> {
        self.event_type.parse()
    }
}

/// Broker message for cross-instance delivery: `{"to","message"}`.
///
/// `message` is the original event payload with routing metadata stripped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeliveryPayload {
    /// Recipient on the destination instance.
    pub to: UserId,
    /// Payload bytes to hand to the recipient unchanged.
    pub message: String,
}

impl RemoteDeliveryPayload {
    /// Strip an event down to what the remote instance needs.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            to: event.to.clone(),
            message: event.payload.clone(),
        }
    }

    /// Serialize for publishing.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a broker message.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }
}
