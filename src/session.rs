//! Per-connection receive loop.
//!
//! One task per connection owns the read half of the transport. Control
//! frames are handled here and never surfaced: Ping is answered with a
//! Pong, Pong is ignored, Close drives the close handshake. Data frames
//! run through the reassembler and come out as complete messages for the
//! application.
//!
//! Event handlers run synchronously on this task, which is what gives the
//! per-connection ordering guarantee: messages are delivered in the order
//! their terminal frame was received, and the disconnect event follows
//! every message that preceded it.

use std::{collections::VecDeque, ops::ControlFlow, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::{Decoder as _, FramedRead};

use crate::{
    Result, WebSocketError,
    close::CloseCode,
    codec::{Decoder, Role},
    connection::{Connection, ConnectionState},
    events::{EventHandlers, Message, MessageKind},
    frame::{Frame, OpCode},
    options::Options,
    reassembly::Reassembler,
    server::Registry,
};

pub(crate) struct Session {
    conn: Arc<Connection>,
    reader: FramedRead<OwnedReadHalf, Decoder>,
    /// Frames fully contained in bytes that arrived with the request head.
    ready: VecDeque<Frame>,
    /// A decode error hit while draining those bytes, surfaced after the
    /// frames that preceded it.
    pending_error: Option<WebSocketError>,
    reassembler: Reassembler,
    handlers: EventHandlers,
    registry: Arc<Registry>,
}

impl Session {
    pub(crate) fn new(
        conn: Arc<Connection>,
        read_half: OwnedReadHalf,
        leftover: Bytes,
        options: &Options,
        handlers: EventHandlers,
        registry: Arc<Registry>,
    ) -> Self {
        let mut decoder = Decoder::new(Role::Server, options.frame_size_limit());

        // Decode whatever arrived in the same reads as the request head up
        // front: the framed reader only decodes after a successful socket
        // read, which may never come for a peer that already said its piece.
        let mut initial = BytesMut::from(leftover.as_ref());
        let mut ready = VecDeque::new();
        let mut pending_error = None;
        loop {
            match decoder.decode(&mut initial) {
                Ok(Some(frame)) => ready.push_back(frame),
                Ok(None) => break,
                Err(err) => {
                    pending_error = Some(err);
                    break;
                }
            }
        }

        // The decoder keeps any half-parsed header state, so the incomplete
        // remainder continues seamlessly once socket bytes arrive.
        let mut reader = FramedRead::new(read_half, decoder);
        reader.read_buffer_mut().extend_from_slice(&initial);

        Self {
            conn,
            reader,
            ready,
            pending_error,
            reassembler: Reassembler::new(options.max_message_size),
            handlers,
            registry,
        }
    }

    /// Runs the loop to completion, then tears the connection down and
    /// fires the disconnect event exactly once.
    pub(crate) async fn run(mut self) {
        let cause = self.read_loop().await;

        if let Some(err) = &cause {
            tracing::debug!(id = self.conn.id(), error = %err, "connection failed");
        }

        self.conn.dispose().await;
        self.registry.remove(self.conn.id());
        self.handlers.emit_disconnect(&self.conn, cause);
    }

    /// Reads frames until the connection ends one way or another.
    ///
    /// Returns the disconnect cause: `None` for clean closures (close
    /// handshake completed, or the connection was disposed locally),
    /// `Some(err)` when a violation or transport failure ended it.
    async fn read_loop(&mut self) -> Option<WebSocketError> {
        let cancelled = self.conn.cancel_token().clone();
        loop {
            let frame = tokio::select! {
                _ = cancelled.cancelled() => return None,
                frame = self.next_frame() => frame,
            };

            let result = match frame {
                // EOF without a close handshake.
                None => return Some(WebSocketError::ConnectionClosed),
                Some(Err(err)) => Err(err),
                Some(Ok(frame)) => self.on_frame(frame).await,
            };

            match result {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return None,
                Err(err) => {
                    // Tell the peer why before releasing the transport,
                    // unless the transport itself is what failed.
                    if !err.is_io_error() {
                        let close = Frame::close(err.close_code(), err.to_string());
                        let _ = self.conn.send_frame(close).await;
                    }
                    return Some(err);
                }
            }
        }
    }

    /// The next inbound frame: first the ones decoded from the handshake
    /// leftover, then the framed reader.
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        if let Some(frame) = self.ready.pop_front() {
            return Some(Ok(frame));
        }
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        self.reader.next().await
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<ControlFlow<()>> {
        match frame.opcode() {
            OpCode::Close => self.on_close(frame).await,
            OpCode::Ping => {
                self.conn.send_frame(Frame::pong(frame.into_payload())).await?;
                Ok(ControlFlow::Continue(()))
            }
            // No keep-alive policy in the core; unsolicited pongs are legal.
            OpCode::Pong => Ok(ControlFlow::Continue(())),
            _ => self.on_data(frame),
        }
    }

    fn on_data(&mut self, frame: Frame) -> Result<ControlFlow<()>> {
        // Once the close handshake is underway, inbound data is discarded;
        // only control frames still get processed.
        if self.conn.state() == ConnectionState::Closing {
            return Ok(ControlFlow::Continue(()));
        }

        if let Some((opcode, payload)) = self.reassembler.push(frame)? {
            let kind = match opcode {
                OpCode::Text => {
                    // Validated on the final assembled payload.
                    if std::str::from_utf8(&payload).is_err() {
                        return Err(WebSocketError::InvalidUTF8);
                    }
                    MessageKind::Text
                }
                _ => MessageKind::Binary,
            };
            self.handlers
                .emit_message(&self.conn, Message::new(kind, payload));
        }

        Ok(ControlFlow::Continue(()))
    }

    async fn on_close(&mut self, frame: Frame) -> Result<ControlFlow<()>> {
        let echo = match frame.payload().len() {
            0 => None,
            // A one-byte payload cannot carry a status code.
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = frame.close_code().expect("payload holds a code");
                if !code.is_sendable() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                frame.close_reason()?;
                Some(code)
            }
        };

        if self.conn.begin_peer_close() {
            // Peer initiated: acknowledge with its own status code.
            let reply = Frame::close(echo.unwrap_or(CloseCode::Normal), "");
            self.conn.send_frame(reply).await?;
        } else {
            // We initiated: this is the peer's reply.
            self.conn.notify_close_reply();
        }

        Ok(ControlFlow::Break(()))
    }
}
