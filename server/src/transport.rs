//! Transport adapter between sessions and the wire.
//!
//! Sessions only need to write text frames, send keepalive pings, write a
//! close frame and read whatever the client sends. [`MessageSink`] and
//! [`MessageStream`] capture exactly that, so the session loops never see a
//! concrete socket type. The WebSocket halves produced by
//! `futures_util::StreamExt::split` implement both traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;

use crate::session::Frame;

/// Errors raised by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is gone.
    #[error("connection closed")]
    Closed,

    /// Reading or writing failed.
    #[error("transport i/o failed: {0}")]
    Io(String),
}

/// A message received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Binary payload, reported by length only.
    Binary(usize),
    /// Ping or pong control frame.
    Control,
    Close,
}

/// Writing half of a connection.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send_text(&mut self, frame: Frame) -> Result<(), TransportError>;

    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Best-effort close frame.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Reading half of a connection.
#[async_trait]
pub trait MessageStream: Send + 'static {
    /// Next client message, or `None` once the connection has ended.
    async fn next_message(&mut self) -> Option<Result<Inbound, TransportError>>;
}

#[async_trait]
impl MessageSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.send(Message::Ping(Default::default()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl MessageStream for SplitStream<WebSocket> {
    async fn next_message(&mut self) -> Option<Result<Inbound, TransportError>> {
        let message = match self.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
        };

        Some(Ok(match message {
            Message::Text(text) => Inbound::Text(text.to_string()),
            Message::Binary(data) => Inbound::Binary(data.len()),
            Message::Ping(_) | Message::Pong(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }))
    }
}
