//! Frame codec: the byte-level encoder/decoder pair for [`Frame`]s.
//!
//! This is the lowest layer of the crate. It turns raw bytes into frames
//! and frames into raw bytes, and nothing else: fragment reassembly, UTF-8
//! validation and control-frame semantics live in the session layer.
//!
//! Both halves implement the [`tokio_util::codec`] traits so they slot into
//! `FramedRead`/`FramedWrite` over the split TCP stream.
//!
//! ## Validation performed while decoding
//!
//! - reserved header bits must be zero (no extension is ever negotiated, so
//!   RSV1 is rejected along with RSV2/RSV3)
//! - opcodes 0x3-0x7 and 0xB-0xF are rejected
//! - control frames must have `fin=1` and a payload of at most 125 bytes
//! - the extended payload length must be minimally encoded: a 16-bit length
//!   must exceed 125, a 64-bit length must exceed 65535 and keep its top
//!   bit clear
//! - in the server role, every frame must be masked
//! - frames above the configured size ceiling are refused

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    WebSocketError, mask,
    frame::{Frame, OpCode},
};

/// The side of the connection a codec speaks for.
///
/// A server never masks outgoing frames and requires incoming frames to be
/// masked; a client does the opposite. The crate itself only ever acts as a
/// server; the client role exists so tests can produce the peer's traffic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Header fields parsed for a frame whose payload has not fully arrived.
struct PartialFrame {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Decodes WebSocket frames from a byte stream.
///
/// The decoder is resumable: when a frame header has been parsed but its
/// payload is incomplete, the parsed header is kept until enough bytes
/// arrive.
pub struct Decoder {
    role: Role,
    partial: Option<PartialFrame>,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a decoder enforcing `max_frame_size` on single-frame
    /// payloads.
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            partial: None,
            max_frame_size,
        }
    }

    fn finish(&self, partial: PartialFrame, src: &mut BytesMut) -> Frame {
        if let Some(mask) = partial.mask {
            mask::apply_mask(&mut src[..partial.payload_len], mask);
        }
        let payload = src.split_to(partial.payload_len).freeze();
        Frame::new(partial.fin, partial.opcode, partial.mask, payload)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Resume a frame whose header was already parsed.
        if let Some(partial) = self.partial.take() {
            if src.remaining() < partial.payload_len {
                self.partial = Some(partial);
                return Ok(None);
            }
            return Ok(Some(self.finish(partial, src)));
        }

        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        if src[0] & 0b0111_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }
        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        let extended = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + extended + if masked { 4 } else { 0 };
        if src.remaining() < header_len {
            return Ok(None);
        }

        src.advance(2);
        let payload_len = match extended {
            0 => usize::from(length_code),
            2 => {
                let len = usize::from(src.get_u16());
                if len <= 125 {
                    return Err(WebSocketError::InvalidPayloadLength);
                }
                len
            }
            _ => {
                let len = src.get_u64();
                if len >> 63 != 0 || len <= 65535 {
                    return Err(WebSocketError::InvalidPayloadLength);
                }
                usize::try_from(len).map_err(|_| WebSocketError::FrameTooLarge)?
            }
        };

        let mask = masked.then(|| src.get_u32().to_be_bytes());
        if self.role == Role::Server && mask.is_none() {
            return Err(WebSocketError::UnmaskedFrame);
        }

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }
        if payload_len > self.max_frame_size {
            return Err(WebSocketError::FrameTooLarge);
        }

        let partial = PartialFrame {
            fin,
            opcode,
            mask,
            payload_len,
        };
        if src.remaining() < payload_len {
            self.partial = Some(partial);
            return Ok(None);
        }

        Ok(Some(self.finish(partial, src)))
    }
}

/// Serializes WebSocket frames into a byte buffer.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // The write path holds control frames to the same rules the
        // decoder enforces on the peer.
        if frame.opcode().is_control() {
            if !frame.is_fin() {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if frame.payload().len() > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        match self.role {
            // Server frames go out unmasked, whatever the caller set.
            Role::Server => frame.mask = None,
            Role::Client => frame.set_random_mask_if_not_set(),
        }

        // One reservation of the exact serialized size.
        dst.reserve(frame.head_len() + frame.payload().len());
        frame.write_head(dst);

        let payload_start = dst.len();
        dst.extend_from_slice(frame.payload());
        if let Some(mask) = frame.mask() {
            mask::apply_mask(&mut dst[payload_start..], mask);
        }

        Ok(())
    }
}
