//! WebSocket frames as defined in [RFC 6455 section 5.2].
//!
//! A frame is the atomic on-wire unit: a small header (FIN bit, opcode,
//! mask bit, payload length, optional masking key) followed by the payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames ([`OpCode::Text`], [`OpCode::Binary`], [`OpCode::Continuation`])
//! carry application payload; control frames ([`OpCode::Close`],
//! [`OpCode::Ping`], [`OpCode::Pong`]) manage the connection and are
//! constrained to `fin=1` with at most 125 payload bytes.
//!
//! [RFC 6455 section 5.2]: https://datatracker.ietf.org/doc/html/rfc6455#section-5.2

use bytes::{BufMut, Bytes, BytesMut};

use crate::{WebSocketError, close::CloseCode};

/// Frame type identifier, the low nibble of the first header octet.
///
/// Values 0x3-0x7 and 0xB-0xF are reserved by RFC 6455 and rejected during
/// decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    /// Continues the message begun by a preceding non-final data frame.
    Continuation,
    /// UTF-8 text payload.
    Text,
    /// Raw binary payload.
    Binary,
    /// Initiates or confirms connection closure.
    Close,
    /// Liveness probe; the peer answers with a Pong.
    Ping,
    /// Answer to a Ping.
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Continuation`, `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Longest close reason that fits a control frame beside the 2-byte code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Bounds a close reason to [`MAX_CLOSE_REASON`] bytes without splitting a
/// UTF-8 sequence.
fn truncate_close_reason(reason: &[u8]) -> &[u8] {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    // Back off continuation bytes so a multi-byte character is dropped whole.
    while end > 0 && reason[end] & 0xC0 == 0x80 {
        end -= 1;
    }
    &reason[..end]
}

/// A single WebSocket frame.
///
/// Constructed through the factory methods ([`Frame::text`],
/// [`Frame::binary`], [`Frame::ping`], [`Frame::pong`], [`Frame::close`],
/// [`Frame::continuation`]), all of which produce final, unmasked frames;
/// [`Frame::with_fin`] and [`Frame::with_mask`] adjust the header for
/// fragmentation and client-side tests.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment of a logical message.
    pub(crate) fin: bool,
    /// Frame type.
    pub(crate) opcode: OpCode,
    /// Masking key; present on client-originated frames.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes. Never trimmed: binary payloads may legitimately end
    /// in 0x00.
    pub(crate) payload: Bytes,
}

impl Frame {
    fn data(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Text, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Binary, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Pong, payload)
    }

    /// Creates a continuation frame.
    ///
    /// The first fragment of a message is a Text or Binary frame with
    /// `fin=0`; every following fragment is a Continuation, and the last
    /// one has `fin=1`.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Continuation, payload)
    }

    /// Creates a close frame whose payload is the big-endian status code
    /// followed by the UTF-8 reason.
    ///
    /// Reasons longer than [`MAX_CLOSE_REASON`] bytes are truncated on a
    /// UTF-8 boundary, keeping the frame inside the 125-byte control
    /// payload bound.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = truncate_close_reason(reason.as_ref());
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(u16::from(code));
        payload.put_slice(reason);
        Self::data(OpCode::Close, payload.freeze())
    }

    /// Creates a close frame with a raw, possibly empty payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::data(OpCode::Close, payload)
    }

    /// Low-level constructor used by the decoder.
    pub(crate) fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: Bytes) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload,
        }
    }

    /// Sets the FIN bit and returns self, for building fragments.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key and returns self.
    ///
    /// Servers never mask; this exists so tests can speak the client side
    /// of the protocol with a known key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Fills in a random masking key unless one is already set.
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(rand::random());
        }
    }

    /// Returns the frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Returns a reference to the payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether this is the final frame of a message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// The masking key, if any.
    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// The payload as UTF-8 text.
    ///
    /// # Panics
    /// Panics if the payload is not valid UTF-8; check with
    /// [`is_utf8`](Self::is_utf8) first for untrusted frames.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.payload).expect("frame payload is not valid UTF-8")
    }

    /// Whether the payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// The status code of a Close frame, when the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// The reason string of a Close frame.
    ///
    /// Returns `Ok(None)` when the payload is empty and
    /// `Err(WebSocketError::InvalidUTF8)` when the reason bytes are not
    /// valid UTF-8.
    pub fn close_reason(&self) -> crate::Result<Option<&str>> {
        if self.payload.is_empty() {
            return Ok(None);
        }

        let reason = self.payload.get(2..).ok_or(WebSocketError::InvalidCloseFrame)?;
        std::str::from_utf8(reason)
            .map(Some)
            .map_err(|_| WebSocketError::InvalidUTF8)
    }

    /// Exact size of the serialized header, so the encoder can reserve one
    /// buffer of the final length.
    pub(crate) fn head_len(&self) -> usize {
        let extended = match self.payload.len() {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + extended + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Serializes the frame header into `dst`.
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        let first = (self.fin as u8) << 7 | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first);
        if len <= 125 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len <= 65535 {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(u8::from(OpCode::try_from(byte).unwrap()), byte);
        }
    }

    #[test]
    fn opcode_reserved_rejected() {
        for byte in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::try_from(byte),
                Err(WebSocketError::InvalidOpCode(b)) if b == byte
            ));
        }
    }

    #[test]
    fn opcode_classes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
    }

    #[test]
    fn text_frame() {
        let frame = Frame::text("Hello");
        assert_eq!(frame.opcode(), OpCode::Text);
        assert!(frame.is_fin());
        assert!(frame.mask().is_none());
        assert_eq!(frame.as_str(), "Hello");
    }

    #[test]
    fn close_frame_payload_layout() {
        let frame = Frame::close(CloseCode::GoingAway, "moving on");
        assert_eq!(&frame.payload()[..2], &1001u16.to_be_bytes());
        assert_eq!(&frame.payload()[2..], b"moving on");
        assert_eq!(frame.close_code(), Some(CloseCode::GoingAway));
        assert_eq!(frame.close_reason().unwrap(), Some("moving on"));
    }

    #[test]
    fn close_frame_empty() {
        let frame = Frame::close_raw(Bytes::new());
        assert!(frame.close_code().is_none());
        assert!(frame.close_reason().unwrap().is_none());
    }

    #[test]
    fn close_reason_invalid_utf8() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        let frame = Frame::close_raw(payload);
        assert!(matches!(frame.close_reason(), Err(WebSocketError::InvalidUTF8)));
    }

    #[test]
    fn close_reason_is_truncated_to_fit_a_control_frame() {
        let frame = Frame::close(CloseCode::Normal, "x".repeat(200));
        assert_eq!(frame.payload().len(), 2 + MAX_CLOSE_REASON);
        assert_eq!(
            frame.close_reason().unwrap(),
            Some("x".repeat(MAX_CLOSE_REASON).as_str())
        );
    }

    #[test]
    fn close_reason_truncation_keeps_utf8_whole() {
        // Two-byte characters: a flat cut at 123 would split one.
        let frame = Frame::close(CloseCode::Normal, "é".repeat(100));
        let kept = frame.close_reason().unwrap().unwrap();
        assert_eq!(kept, "é".repeat(61));
        assert_eq!(frame.payload().len(), 2 + 122);
    }

    #[test]
    fn binary_payload_keeps_trailing_zeros() {
        let frame = Frame::binary(vec![0x01, 0x00, 0x00]);
        assert_eq!(frame.payload().as_ref(), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn head_len_matches_written_head() {
        let cases = [
            Frame::text("short"),
            Frame::binary(vec![0u8; 126]),
            Frame::binary(vec![0u8; 65535]),
            Frame::binary(vec![0u8; 65536]),
            Frame::text("masked").with_mask([1, 2, 3, 4]),
        ];

        for frame in cases {
            let mut head = BytesMut::new();
            frame.write_head(&mut head);
            assert_eq!(head.len(), frame.head_len());
        }
    }

    #[test]
    fn fragment_builders() {
        let first = Frame::text("He").with_fin(false);
        let last = Frame::continuation("llo");
        assert!(!first.is_fin());
        assert_eq!(first.opcode(), OpCode::Text);
        assert!(last.is_fin());
        assert_eq!(last.opcode(), OpCode::Continuation);
    }
}
