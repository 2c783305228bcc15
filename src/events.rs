//! Application-facing message type and event subscription record.
//!
//! The server exposes exactly three subscription points: connect, message
//! and disconnect. Handlers are plain functions invoked synchronously on
//! the receive task of the triggering connection, so they must not block;
//! a handler that wants to write back clones the `Arc<Connection>` and
//! sends from a spawned task.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use bytes::Bytes;

use crate::{Connection, WebSocketError, frame::OpCode};

/// Whether a message carries text or binary payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            Self::Text => OpCode::Text,
            Self::Binary => OpCode::Binary,
        }
    }
}

/// A complete logical message, after any reassembly.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: Bytes::from(text.into()),
        }
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    pub(crate) fn new(kind: MessageKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the message and returns its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The UTF-8 view of the payload.
    ///
    /// Always `Some` for text messages delivered by the server, which are
    /// validated on reassembly.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

type ConnectFn = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type MessageFn = Arc<dyn Fn(&Arc<Connection>, Message) + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(&Arc<Connection>, Option<WebSocketError>) + Send + Sync>;

/// The three event sinks an application can subscribe.
///
/// Each event fires at most once per occurrence, on the receive task of the
/// connection involved. Connect fires after the 101 response is fully
/// written and the connection is registered; disconnect fires exactly once
/// per connection that reached connect, with `None` for clean closures and
/// the terminating error otherwise.
///
/// ```rust
/// use gale::EventHandlers;
///
/// let handlers = EventHandlers::new()
///     .on_message(|_conn, message| println!("got {} bytes", message.len()));
/// ```
#[derive(Default, Clone)]
pub struct EventHandlers {
    on_connect: Option<ConnectFn>,
    on_message: Option<MessageFn>,
    on_disconnect: Option<DisconnectFn>,
}

impl EventHandlers {
    /// An empty subscription record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the connect sink.
    pub fn on_connect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    /// Subscribes the message sink.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>, Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Subscribes the disconnect sink.
    pub fn on_disconnect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>, Option<WebSocketError>) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    pub(crate) fn emit_connect(&self, conn: &Arc<Connection>) {
        if let Some(handler) = &self.on_connect {
            guard(conn, "connect", || handler(conn));
        }
    }

    pub(crate) fn emit_message(&self, conn: &Arc<Connection>, message: Message) {
        if let Some(handler) = &self.on_message {
            guard(conn, "message", || handler(conn, message));
        }
    }

    pub(crate) fn emit_disconnect(&self, conn: &Arc<Connection>, cause: Option<WebSocketError>) {
        if let Some(handler) = &self.on_disconnect {
            guard(conn, "disconnect", || handler(conn, cause));
        }
    }
}

/// Catches a panicking handler at the receive-task boundary. The panic is
/// logged and the receive loop keeps running.
fn guard(conn: &Arc<Connection>, event: &str, call: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .map(str::to_owned)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        tracing::error!(id = conn.id(), event, panic = %message, "event handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message() {
        let message = Message::text("héllo");
        assert_eq!(message.kind(), MessageKind::Text);
        assert_eq!(message.as_str(), Some("héllo"));
        assert_eq!(message.len(), "héllo".len());
    }

    #[test]
    fn binary_message() {
        let message = Message::binary(vec![0x00, 0xFF, 0x00]);
        assert_eq!(message.kind(), MessageKind::Binary);
        assert_eq!(message.payload().as_ref(), &[0x00, 0xFF, 0x00]);
        assert_eq!(message.as_str(), None);
    }

    #[test]
    fn empty_message() {
        let message = Message::binary(Bytes::new());
        assert!(message.is_empty());
        assert_eq!(message.len(), 0);
    }

    #[test]
    fn kind_to_opcode() {
        assert_eq!(MessageKind::Text.opcode(), OpCode::Text);
        assert_eq!(MessageKind::Binary.opcode(), OpCode::Binary);
    }
}
