//! Reassembly of fragmented messages.
//!
//! A logical message is one non-continuation data frame with `fin=1`, or a
//! non-final data frame followed by continuation frames of which exactly
//! the last has `fin=1`. Control frames never pass through here; the
//! session dispatches them before feeding the reassembler.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Result, WebSocketError,
    frame::{Frame, OpCode},
};

/// An in-progress fragmented message.
struct PartialMessage {
    opcode: OpCode,
    total_len: usize,
    parts: Vec<Bytes>,
}

/// Pure state machine that folds data frames into complete messages.
pub(crate) struct Reassembler {
    max_message_size: usize,
    partial: Option<PartialMessage>,
}

impl Reassembler {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
        }
    }

    /// Feeds one data frame.
    ///
    /// Returns `Ok(Some((opcode, payload)))` when the frame completes a
    /// message (the opcode is the one that began it), `Ok(None)` while more
    /// fragments are expected, and an error on fragmentation-rule
    /// violations or when the running total crosses the message ceiling.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<Option<(OpCode, Bytes)>> {
        match frame.opcode() {
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(WebSocketError::FragmentedMessageInterrupted);
                }

                let (opcode, fin) = (frame.opcode(), frame.is_fin());
                let payload = frame.into_payload();
                self.check_size(payload.len())?;

                if fin {
                    return Ok(Some((opcode, payload)));
                }
                self.partial = Some(PartialMessage {
                    opcode,
                    total_len: payload.len(),
                    parts: vec![payload],
                });
                Ok(None)
            }
            OpCode::Continuation => {
                let mut partial = self
                    .partial
                    .take()
                    .ok_or(WebSocketError::UnexpectedContinuation)?;

                let fin = frame.is_fin();
                let payload = frame.into_payload();
                partial.total_len += payload.len();
                self.check_size(partial.total_len)?;
                partial.parts.push(payload);

                if !fin {
                    self.partial = Some(partial);
                    return Ok(None);
                }

                let mut assembled = BytesMut::with_capacity(partial.total_len);
                for part in partial.parts {
                    assembled.put(part);
                }
                Ok(Some((partial.opcode, assembled.freeze())))
            }
            opcode => {
                debug_assert!(false, "control frame {opcode:?} fed to reassembler");
                Err(WebSocketError::InvalidOpCode(u8::from(opcode)))
            }
        }
    }

    fn check_size(&self, total: usize) -> Result<()> {
        if total > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_MESSAGE_SIZE;

    fn reassembler() -> Reassembler {
        Reassembler::new(MAX_MESSAGE_SIZE)
    }

    #[test]
    fn single_frame_message() {
        let mut r = reassembler();
        let (opcode, payload) = r.push(Frame::text("Hello")).unwrap().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload.as_ref(), b"Hello");
    }

    #[test]
    fn three_fragment_binary_message() {
        let mut r = reassembler();
        assert!(r
            .push(Frame::binary(vec![0x01, 0x02]).with_fin(false))
            .unwrap()
            .is_none());
        assert!(r
            .push(Frame::continuation(vec![0x03]).with_fin(false))
            .unwrap()
            .is_none());
        let (opcode, payload) = r.push(Frame::continuation(vec![0x04])).unwrap().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(payload.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn initial_opcode_wins() {
        let mut r = reassembler();
        r.push(Frame::text("par").with_fin(false)).unwrap();
        let (opcode, payload) = r.push(Frame::continuation("tial")).unwrap().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload.as_ref(), b"partial");
    }

    #[test]
    fn continuation_without_start() {
        let mut r = reassembler();
        assert!(matches!(
            r.push(Frame::continuation("orphan")),
            Err(WebSocketError::UnexpectedContinuation)
        ));
    }

    #[test]
    fn data_frame_interleaved_into_fragmented_message() {
        let mut r = reassembler();
        r.push(Frame::binary(vec![1]).with_fin(false)).unwrap();
        assert!(matches!(
            r.push(Frame::text("interloper")),
            Err(WebSocketError::FragmentedMessageInterrupted)
        ));
    }

    #[test]
    fn reassembler_resets_after_completion() {
        let mut r = reassembler();
        r.push(Frame::text("a").with_fin(false)).unwrap();
        r.push(Frame::continuation("b")).unwrap().unwrap();

        // A fresh message starts cleanly.
        let (opcode, payload) = r.push(Frame::binary(vec![9])).unwrap().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(payload.as_ref(), &[9]);
    }

    #[test]
    fn message_ceiling_enforced() {
        let mut r = Reassembler::new(4);
        r.push(Frame::binary(vec![0; 3]).with_fin(false)).unwrap();
        assert!(matches!(
            r.push(Frame::continuation(vec![0; 2])),
            Err(WebSocketError::MessageTooLarge)
        ));
    }

    #[test]
    fn single_frame_at_ceiling_passes() {
        let mut r = Reassembler::new(4);
        // A final frame at exactly the limit is delivered; one past it is not.
        assert!(r.push(Frame::binary(vec![0; 4])).unwrap().is_some());
        assert!(matches!(
            r.push(Frame::binary(vec![0; 5])),
            Err(WebSocketError::MessageTooLarge)
        ));
    }

    #[test]
    fn empty_fragments() {
        let mut r = reassembler();
        assert!(r.push(Frame::text("").with_fin(false)).unwrap().is_none());
        assert!(r
            .push(Frame::continuation("").with_fin(false))
            .unwrap()
            .is_none());
        let (opcode, payload) = r.push(Frame::continuation("")).unwrap().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert!(payload.is_empty());
    }
}
