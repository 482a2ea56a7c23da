//! Reassembly of fragmented WebSocket messages (RFC 6455 Section 5.4).

use bytes::BytesMut;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{Frame, OpCode};

/// Reassembles contiguous data frames into complete messages.
///
/// Control frames interleaved between fragments are ignored here; the
/// connection handles them before they reach the assembler.
pub struct MessageAssembler {
    buffer: BytesMut,
    fragment_count: usize,
    opcode: Option<OpCode>,
    limits: Limits,
}

impl MessageAssembler {
    pub fn new(limits: Limits) -> Self {
        Self {
            buffer: BytesMut::new(),
            fragment_count: 0,
            opcode: None,
            limits,
        }
    }

    /// Add a data frame to the message being assembled.
    ///
    /// Returns `Some(message)` when the frame carries FIN=1 and the message
    /// is complete, `None` while more continuation frames are expected.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for out-of-sequence continuation frames
    /// - `Error::MessageTooLarge` / `Error::TooManyFragments` on limit breach
    /// - `Error::InvalidUtf8` if a completed text message is not valid UTF-8
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        if frame.opcode.is_control() {
            return Ok(None);
        }

        if frame.opcode == OpCode::Continuation {
            if self.opcode.is_none() {
                return Err(Error::ProtocolViolation(
                    "Unexpected continuation frame".into(),
                ));
            }
        } else {
            if self.opcode.is_some() {
                return Err(Error::ProtocolViolation(
                    "Expected continuation frame".into(),
                ));
            }
            self.opcode = Some(frame.opcode);
        }

        self.limits.check_fragment_count(self.fragment_count + 1)?;
        self.limits
            .check_message_size(self.buffer.len() + frame.payload().len())?;

        let fin = frame.fin;
        self.buffer.extend_from_slice(frame.payload());
        self.fragment_count += 1;

        if !fin {
            return Ok(None);
        }

        let payload = self.buffer.split().to_vec();
        let opcode = self.opcode.take().unwrap_or(OpCode::Binary);
        self.fragment_count = 0;

        match opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(Message::Text(text)))
            }
            _ => Ok(Some(Message::Binary(payload))),
        }
    }

    /// Whether a fragmented message is currently in flight.
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }
}
