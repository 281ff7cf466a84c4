//! Transport-neutral frame type.
//!
//! Sessions read and write [`Frame`]s so the same loops drive an axum
//! `WebSocket` in production and a channel pair in tests.

use axum::extract::ws::Message;
use bytes::Bytes;

/// One transport frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Keepalive probe.
    Ping(Bytes),
    /// Keepalive acknowledgement.
    Pong(Bytes),
    /// Protocol close.
    Close,
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(t) => Self::Text(t.as_str().to_owned()),
            Message::Binary(b) => Self::Binary(b),
            Message::Ping(b) => Self::Ping(b),
            Message::Pong(b) => Self::Pong(b),
            Message::Close(_) => Self::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => Self::Text(t.into()),
            Frame::Binary(b) => Self::Binary(b),
            Frame::Ping(b) => Self::Ping(b),
            Frame::Pong(b) => Self::Pong(b),
            Frame::Close => Self::Close(None),
        }
    }
}
