//! A single accepted peer after a successful upgrade.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::SinkExt;
use tokio::{
    net::tcp::OwnedWriteHalf,
    sync::{Mutex, Notify},
};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

use crate::{
    Result, WebSocketError,
    close::CloseCode,
    codec::Encoder,
    events::Message,
    frame::{Frame, OpCode},
    handshake::HeaderMap,
};

/// Close state of a connection.
///
/// A connection only exists once the handshake has succeeded, so the value
/// enters the machine at `Open`. It moves to `Closing` when either side
/// starts the close handshake and to `Closed` when the handshake completes,
/// times out, or the transport fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One connected WebSocket peer.
///
/// Handed to every event handler as an `Arc`, and usable from any task:
/// the write path is serialized by an internal mutex, so concurrent
/// [`send_frame`](Self::send_frame) calls interleave whole frames, never
/// bytes. Reads are owned by the connection's receive task and are not
/// exposed here.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    created_at: Instant,
    url: String,
    headers: HeaderMap,
    writer: Mutex<FramedWrite<OwnedWriteHalf, Encoder>>,
    state: AtomicU8,
    cancel: CancellationToken,
    close_reply: Notify,
    close_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        url: String,
        headers: HeaderMap,
        writer: FramedWrite<OwnedWriteHalf, Encoder>,
        cancel: CancellationToken,
        close_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer_addr,
            created_at: Instant::now(),
            url,
            headers,
            writer: Mutex::new(writer),
            state: AtomicU8::new(ConnectionState::Open as u8),
            cancel,
            close_reply: Notify::new(),
            close_timeout,
        }
    }

    /// Server-assigned connection id, unique for the server's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the connection finished its handshake.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The query-string portion of the upgrade request target.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Headers of the upgrade request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Current close state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Serializes one frame and writes it atomically.
    ///
    /// Callers racing for the write path are serialized by the connection's
    /// send mutex. Fails with [`WebSocketError::ConnectionClosed`] once the
    /// transport has been released.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(WebSocketError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    /// Sends a complete message as a single unmasked frame with `fin=1`.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let opcode = message.kind().opcode();
        self.send_frame(Frame::new(true, opcode, None, message.into_payload()))
            .await
    }

    /// Sends a control frame.
    ///
    /// Rejects data opcodes and payloads over 125 bytes.
    pub async fn send_control(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        if !opcode.is_control() {
            return Err(WebSocketError::InvalidOpCode(u8::from(opcode)));
        }
        let payload = payload.into();
        if payload.len() > 125 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.send_frame(Frame::new(true, opcode, None, payload)).await
    }

    /// Starts a graceful close.
    ///
    /// Transitions to `Closing`, sends a Close frame, waits for the peer's
    /// Close reply for at most the configured close timeout, then releases
    /// the transport. Fails with [`WebSocketError::ConnectionClosed`] when
    /// a close is already underway.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if !self.transition(ConnectionState::Open, ConnectionState::Closing) {
            return Err(WebSocketError::ConnectionClosed);
        }

        if let Err(err) = self.send_frame(Frame::close(code, reason)).await {
            self.dispose().await;
            return Err(err);
        }

        let _ = tokio::time::timeout(self.close_timeout, self.close_reply.notified()).await;
        self.dispose().await;
        Ok(())
    }

    /// Releases the transport. Idempotent.
    ///
    /// Cancels the receive task, flushes and shuts down the write half.
    pub async fn dispose(&self) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if ConnectionState::from_u8(previous) == ConnectionState::Closed {
            return;
        }

        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    /// Marks the peer's close handshake as underway (peer sent Close
    /// first). Returns `false` when the connection was not open.
    pub(crate) fn begin_peer_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
    }

    /// Wakes a [`close`](Self::close) call waiting on the peer's reply.
    pub(crate) fn notify_close_reply(&self) {
        self.close_reply.notify_one();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
    };
    use tokio_util::codec::Decoder as _;

    use super::*;
    use crate::codec::{Decoder, Role};

    /// Accepts one TCP connection and wraps its write half in a Connection.
    async fn connection_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        let (_read, write) = stream.into_split();
        let conn = Connection::new(
            1,
            peer_addr,
            "x=1".to_owned(),
            HeaderMap::default(),
            FramedWrite::new(write, Encoder::new(Role::Server)),
            CancellationToken::new(),
            Duration::from_millis(50),
        );
        (conn, client)
    }

    async fn read_frame(client: &mut TcpStream) -> Frame {
        let mut decoder = Decoder::new(Role::Client, crate::MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 256];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn send_message_writes_unmasked_final_frame() {
        let (conn, mut client) = connection_pair().await;

        conn.send_message(Message::text("Hello")).await.unwrap();
        let frame = read_frame(&mut client).await;
        assert_eq!(frame.opcode(), OpCode::Text);
        assert!(frame.is_fin());
        assert!(frame.mask().is_none());
        assert_eq!(frame.as_str(), "Hello");
    }

    #[tokio::test]
    async fn send_control_validates() {
        let (conn, _client) = connection_pair().await;

        assert!(matches!(
            conn.send_control(OpCode::Text, "nope").await,
            Err(WebSocketError::InvalidOpCode(0x1))
        ));
        assert!(matches!(
            conn.send_control(OpCode::Ping, vec![0u8; 126]).await,
            Err(WebSocketError::ControlFrameTooLarge)
        ));
        conn.send_control(OpCode::Ping, vec![0u8; 125]).await.unwrap();
    }

    #[tokio::test]
    async fn close_sends_frame_and_times_out_without_reply() {
        let (conn, mut client) = connection_pair().await;

        assert_eq!(conn.state(), ConnectionState::Open);
        conn.close(CloseCode::Normal, "bye").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let frame = read_frame(&mut client).await;
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason().unwrap(), Some("bye"));

        // Transport released: the client sees EOF.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn close_bounds_long_reasons() {
        let (conn, mut client) = connection_pair().await;

        conn.close(CloseCode::Normal, &"x".repeat(200)).await.unwrap();

        let frame = read_frame(&mut client).await;
        assert_eq!(frame.opcode(), OpCode::Close);
        assert!(frame.payload().len() <= 125);
        assert_eq!(frame.close_reason().unwrap().unwrap().len(), 123);
    }

    #[tokio::test]
    async fn close_returns_quickly_when_reply_already_arrived() {
        let (conn, _client) = connection_pair().await;

        // The receive loop signals the reply before close() starts waiting.
        conn.notify_close_reply();
        let started = Instant::now();
        conn.close(CloseCode::Normal, "").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn sends_fail_after_dispose() {
        let (conn, _client) = connection_pair().await;

        conn.dispose().await;
        conn.dispose().await; // idempotent
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.cancel_token().is_cancelled());
        assert!(matches!(
            conn.send_message(Message::text("late")).await,
            Err(WebSocketError::ConnectionClosed)
        ));
        assert!(matches!(
            conn.close(CloseCode::Normal, "").await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }
}
