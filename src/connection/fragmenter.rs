//! Fragmentation of outgoing data messages (RFC 6455 Section 5.4).

use crate::protocol::{Frame, OpCode};

/// Iterator that yields the frames of an outgoing message.
///
/// Payloads above `fragment_size` are split: the first frame carries the
/// message opcode, the rest are continuations, the last has FIN set.
pub struct MessageFragmenter<'a> {
    payload: &'a [u8],
    opcode: OpCode,
    fragment_size: usize,
    offset: usize,
    is_first: bool,
}

impl<'a> MessageFragmenter<'a> {
    #[must_use]
    pub fn new(payload: &'a [u8], opcode: OpCode, fragment_size: usize) -> Self {
        Self {
            payload,
            opcode,
            fragment_size: fragment_size.max(1),
            offset: 0,
            is_first: true,
        }
    }
}

impl<'a> Iterator for MessageFragmenter<'a> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            // An empty message still yields one empty final frame.
            if self.is_first && self.payload.is_empty() {
                self.is_first = false;
                return Some(Frame::new(true, self.opcode, Vec::new()));
            }
            return None;
        }

        let remaining = self.payload.len() - self.offset;
        let chunk_size = remaining.min(self.fragment_size);
        let is_final = self.offset + chunk_size >= self.payload.len();

        let chunk = self.payload[self.offset..self.offset + chunk_size].to_vec();
        self.offset += chunk_size;

        let opcode = if self.is_first {
            self.is_first = false;
            self.opcode
        } else {
            OpCode::Continuation
        };

        Some(Frame::new(is_final, opcode, chunk))
    }
}
