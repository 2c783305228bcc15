//! # gale
//!
//! Server-side WebSocket endpoint (RFC 6455) for tokio.
//!
//! gale accepts plain TCP connections, performs the HTTP/1.1 Upgrade
//! handshake by reading the request head directly off the raw byte stream,
//! and then carries framed messages between the network and three
//! application-level event sinks. The crate is a server only: it never dials
//! out, never masks the frames it sends, and requires every frame it
//! receives to be masked.
//!
//! ## Layers
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Application (connect / message / disconnect)   │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//! ┌──────────────────▼─────────────────────────────┐
//! │ Server                                         │
//! │ • accept loop + bounded handshake pool         │
//! │ • client registry                              │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//! ┌──────────────────▼─────────────────────────────┐
//! │ Session (one receive task per connection)      │
//! │ • control frame handling (close/ping/pong)     │
//! │ • continuation reassembly + UTF-8 validation   │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//! ┌──────────────────▼─────────────────────────────┐
//! │ Codec                                          │
//! │ • frame encoding/decoding                      │
//! │ • masking/unmasking                            │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//!               Network (TCP)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use gale::{EventHandlers, Options, Server};
//!
//! #[tokio::main]
//! async fn main() -> gale::Result<()> {
//!     let handlers = EventHandlers::new()
//!         .on_connect(|conn| tracing::info!(id = conn.id(), url = conn.url(), "client connected"))
//!         .on_message(|conn, message| {
//!             // Handlers run on the connection's receive task; reply from a
//!             // spawned task so the loop keeps draining frames.
//!             let conn = conn.clone();
//!             tokio::spawn(async move {
//!                 let _ = conn.send_message(message).await;
//!             });
//!         })
//!         .on_disconnect(|conn, cause| tracing::info!(id = conn.id(), ?cause, "client gone"));
//!
//!     let server = Server::new(Options::default(), handlers);
//!     server.start("127.0.0.1:9001".parse().unwrap()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol handling
//!
//! Control frames are consumed inside the receive loop and never reach the
//! application: an incoming Ping is answered with a Pong carrying the same
//! payload, Pongs are ignored (no keep-alive policy in the core), and a
//! Close is acknowledged with the peer's status code before teardown.
//! Fragmented messages are reassembled before delivery; text payloads are
//! validated as UTF-8 on the assembled message.

pub mod close;
pub mod codec;
mod connection;
mod events;
pub mod frame;
pub mod handshake;
#[doc(hidden)]
pub mod mask;
mod options;
mod reassembly;
mod server;
mod session;

pub use close::CloseCode;
pub use codec::Role;
pub use connection::{Connection, ConnectionState};
pub use events::{EventHandlers, Message, MessageKind};
pub use frame::{Frame, OpCode};
pub use handshake::HeaderMap;
pub use options::Options;
pub use server::Server;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// The default ceiling for a reassembled message, 16 MiB.
///
/// Crossing it closes the connection with status 1009.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Request headers did not fit the negotiator's buffer.
    #[error("request headers exceed {0} bytes")]
    RequestHeadersTooLarge(usize),

    /// Request line could not be parsed.
    #[error("malformed request line")]
    MalformedRequestLine,

    /// Request target carries no query string.
    #[error("request target has no query string")]
    MissingQueryString,

    /// Missing Host header.
    #[error("Host header is missing")]
    MissingHostHeader,

    /// Missing or invalid "Upgrade: websocket" header.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Missing or invalid "Connection: upgrade" header.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// Sec-WebSocket-Version is not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// Missing Sec-WebSocket-Key header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The handshake did not complete within its time budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Invalid frame opcode.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits in the frame header are not zero.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Control frame without the FIN bit.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// Client frame arrived without a masking key.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// Extended payload length violates its size class.
    #[error("payload length is not minimally encoded")]
    InvalidPayloadLength,

    /// Continuation frame without an initial data frame.
    #[error("continuation frame without initial frame")]
    UnexpectedContinuation,

    /// New data frame while a fragmented message was still open.
    #[error("data frame interleaved into a fragmented message")]
    FragmentedMessageInterrupted,

    /// Close frame has an invalid payload layout.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// Close frame carries a status code that must not appear on the wire.
    #[error("invalid close code")]
    InvalidCloseCode,

    /// Payload is not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUTF8,

    /// A single frame exceeds the configured maximum.
    #[error("frame too large")]
    FrameTooLarge,

    /// A reassembled message exceeds the configured maximum.
    #[error("message too large")]
    MessageTooLarge,

    /// Connection has been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The server is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns `true` if this error belongs to the upgrade handshake.
    ///
    /// Handshake errors are answered with an HTTP error status and never
    /// reach the application event sinks.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::RequestHeadersTooLarge(_)
                | Self::MalformedRequestLine
                | Self::MissingQueryString
                | Self::MissingHostHeader
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::InvalidSecWebSocketVersion
                | Self::MissingSecWebSocketKey
                | Self::HandshakeTimeout
        )
    }

    /// Returns `true` if this is a post-handshake RFC 6455 violation.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOpCode(_)
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::UnmaskedFrame
                | Self::InvalidPayloadLength
                | Self::UnexpectedContinuation
                | Self::FragmentedMessageInterrupted
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::InvalidUTF8
        )
    }

    /// Returns `true` if this wraps an I/O error.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }

    /// The close status the server sends when this error terminates a
    /// connection.
    pub(crate) fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUTF8 => CloseCode::Invalid,
            Self::FrameTooLarge | Self::MessageTooLarge => CloseCode::Size,
            err if err.is_protocol_error() => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
