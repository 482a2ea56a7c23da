//! WebSocket frame parsing and serialization (RFC 6455).

use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::mask::apply_mask;
use crate::protocol::OpCode;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

#[derive(Debug, Clone)]
struct FrameHeader {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// Parse frame header from buffer.
///
/// # Errors
///
/// - `Error::IncompleteFrame` if not enough data is available
/// - `Error::InvalidOpcode` / `Error::ReservedOpcode` for bad opcodes
fn parse_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < 2 {
        return Err(Error::IncompleteFrame {
            needed: 2 - buf.len(),
        });
    }

    let byte0 = buf[0];
    let byte1 = buf[1];

    let fin = (byte0 & 0x80) != 0;
    let rsv1 = (byte0 & 0x40) != 0;
    let rsv2 = (byte0 & 0x20) != 0;
    let rsv3 = (byte0 & 0x10) != 0;
    let opcode = OpCode::from_u8(byte0 & 0x0F)?;

    let masked = (byte1 & 0x80) != 0;
    let payload_len_initial = byte1 & 0x7F;

    let (payload_len, header_size) = match payload_len_initial {
        0..=125 => (payload_len_initial as usize, 2),
        126 => {
            if buf.len() < 4 {
                return Err(Error::IncompleteFrame {
                    needed: 4 - buf.len(),
                });
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Err(Error::IncompleteFrame {
                    needed: 10 - buf.len(),
                });
            }
            let len_u64 = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            let len = usize::try_from(len_u64).map_err(|_| Error::FrameTooLarge {
                size: usize::MAX,
                max: usize::MAX,
            })?;
            (len, 10)
        }
        _ => unreachable!(),
    };

    let total_header_size = if masked { header_size + 4 } else { header_size };

    if masked && buf.len() < total_header_size {
        return Err(Error::IncompleteFrame {
            needed: total_header_size - buf.len(),
        });
    }

    let mask = if masked {
        Some([
            buf[header_size],
            buf[header_size + 1],
            buf[header_size + 2],
            buf[header_size + 3],
        ])
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        mask,
        payload_len,
        header_len: total_header_size,
    })
}

/// A WebSocket frame as defined in RFC 6455.
///
/// Frames are the basic unit of communication in the WebSocket protocol.
/// This struct supports both parsing incoming frames and creating outgoing
/// frames; parsing unmasks the payload so `payload()` is always plaintext.
///
/// ## Frame Structure
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode |M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)   |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                         Masking key (if present)              |
/// +---------------------------------------------------------------+
/// |                     Payload data                              |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag. True if this is the last fragment of a message.
    pub fin: bool,
    /// Reserved bit 1. Must be 0 (no extensions are negotiated).
    pub rsv1: bool,
    /// Reserved bit 2. Must be 0.
    pub rsv2: bool,
    /// Reserved bit 3. Must be 0.
    pub rsv3: bool,
    /// Frame opcode defining the interpretation of payload data.
    pub opcode: OpCode,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given parameters.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload,
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame with optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = if let Some(code) = code {
            let mut data = code.to_be_bytes().to_vec();
            data.extend_from_slice(reason.as_bytes());
            data
        } else {
            Vec::new()
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Get the payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Parse a frame from a buffer.
    ///
    /// Returns the parsed frame and the number of bytes consumed. Masked
    /// payloads are unmasked during parsing.
    ///
    /// ## Errors
    ///
    /// - `Error::IncompleteFrame` if not enough data is available
    /// - `Error::InvalidOpcode` / `Error::ReservedOpcode` for bad opcodes
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let header = parse_header(buf)?;

        let total_size =
            header
                .header_len
                .checked_add(header.payload_len)
                .ok_or(Error::FrameTooLarge {
                    size: header.payload_len,
                    max: usize::MAX - header.header_len,
                })?;

        if buf.len() < total_size {
            return Err(Error::IncompleteFrame {
                needed: total_size - buf.len(),
            });
        }

        let payload_start = header.header_len;
        let mut payload = buf[payload_start..payload_start + header.payload_len].to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        let frame = Frame {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            opcode: header.opcode,
            payload,
        };

        Ok((frame, total_size))
    }

    /// Validate the frame according to RFC 6455.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` if RSV bits are set
    /// - `Error::FragmentedControlFrame` if control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if control frame payload > 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }

            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }

        Ok(())
    }

    /// Write the frame to a buffer.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer to write to
    /// * `mask` - Optional masking key (required for client frames)
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too small.
    pub fn write(&self, buf: &mut [u8], mask: Option<[u8; 4]>) -> Result<usize> {
        let payload_len = self.payload.len();

        let (len_byte, extended_len_size) = if payload_len <= 125 {
            (payload_len as u8, 0)
        } else if payload_len <= 65535 {
            (126, 2)
        } else {
            (127, 8)
        };

        let mask_size = if mask.is_some() { 4 } else { 0 };
        let header_size = 2 + extended_len_size + mask_size;
        let total_size = header_size + payload_len;

        if buf.len() < total_size {
            return Err(Error::InvalidFrame(format!(
                "Buffer too small: need {} bytes, have {}",
                total_size,
                buf.len()
            )));
        }

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        buf[0] = byte0;

        let mut byte1 = len_byte;
        if mask.is_some() {
            byte1 |= 0x80;
        }
        buf[1] = byte1;

        let mut offset = 2;
        match extended_len_size {
            2 => {
                buf[offset..offset + 2].copy_from_slice(&(payload_len as u16).to_be_bytes());
                offset += 2;
            }
            8 => {
                buf[offset..offset + 8].copy_from_slice(&(payload_len as u64).to_be_bytes());
                offset += 8;
            }
            _ => {}
        }

        if let Some(mask_key) = mask {
            buf[offset..offset + 4].copy_from_slice(&mask_key);
            offset += 4;
        }

        buf[offset..offset + payload_len].copy_from_slice(&self.payload);

        if let Some(mask_key) = mask {
            apply_mask(&mut buf[offset..offset + payload_len], mask_key);
        }

        Ok(total_size)
    }

    /// Calculate the size needed to write this frame.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let payload_len = self.payload.len();
        let extended_len_size = if payload_len <= 125 {
            0
        } else if payload_len <= 65535 {
            2
        } else {
            8
        };
        let mask_size = if masked { 4 } else { 0 };
        2 + extended_len_size + mask_size + payload_len
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(s) => Frame::text(s.into_bytes()),
            Message::Binary(d) => Frame::binary(d),
            Message::Ping(d) => Frame::ping(d),
            Message::Pong(d) => Frame::pong(d),
            Message::Close(Some(cf)) => Frame::close(Some(cf.code.as_u16()), &cf.reason),
            Message::Close(None) => Frame::close(None, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unmasked_text_frame() {
        // FIN=1, opcode=1 (text), unmasked, payload="Hello"
        let data = &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 7);
        assert!(frame.fin);
        assert!(!frame.rsv1);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn test_parse_masked_text_frame() {
        // FIN=1, opcode=1 (text), masked with [0x37, 0xfa, 0x21, 0x3d], payload="Hello"
        let data = &[
            0x81, 0x85, // FIN + Text, MASK + len=5
            0x37, 0xfa, 0x21, 0x3d, // Mask key
            0x7f, 0x9f, 0x4d, 0x51, 0x58, // Masked "Hello"
        ];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 11);
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn test_parse_binary_frame() {
        let data = &[0x82, 0x03, 0x01, 0x02, 0x03];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 5);
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_parse_close_frame() {
        // payload=[0x03, 0xe8] (1000 = normal close)
        let data = &[0x88, 0x02, 0x03, 0xe8];
        let (frame, len) = Frame::parse(data).unwrap();
        assert_eq!(len, 4);
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.payload(), &[0x03, 0xe8]);
    }

    #[test]
    fn test_parse_ping_pong_frames() {
        let (frame, _) = Frame::parse(&[0x89, 0x04, 0x70, 0x69, 0x6e, 0x67]).unwrap();
        assert_eq!(frame.opcode, OpCode::Ping);
        assert_eq!(frame.payload(), b"ping");

        let (frame, _) = Frame::parse(&[0x8a, 0x04, 0x70, 0x6f, 0x6e, 0x67]).unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(frame.payload(), b"pong");
    }

    #[test]
    fn test_parse_fragmented_and_continuation_frames() {
        // FIN=0, opcode=1 (text), payload="Hel"
        let (frame, _) = Frame::parse(&[0x01, 0x03, 0x48, 0x65, 0x6c]).unwrap();
        assert!(!frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"Hel");

        // FIN=1, opcode=0 (continuation), payload="lo"
        let (frame, _) = Frame::parse(&[0x80, 0x02, 0x6c, 0x6f]).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Continuation);
        assert_eq!(frame.payload(), b"lo");
    }

    #[test]
    fn test_parse_extended_length_126() {
        // 16-bit extended length, 256 bytes of 0xAB
        let mut data = vec![0x82, 0x7e, 0x01, 0x00];
        data.extend(vec![0xab; 256]);

        let (frame, len) = Frame::parse(&data).unwrap();
        assert_eq!(len, 4 + 256);
        assert_eq!(frame.payload().len(), 256);
        assert!(frame.payload().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_parse_extended_length_127() {
        // 64-bit extended length, 65536 bytes of 0xCD
        let mut data = vec![0x82, 0x7f];
        data.extend(65536u64.to_be_bytes());
        data.extend(vec![0xcd; 65536]);

        let (frame, len) = Frame::parse(&data).unwrap();
        assert_eq!(len, 10 + 65536);
        assert_eq!(frame.payload().len(), 65536);
    }

    #[test]
    fn test_parse_empty_payload() {
        let (frame, len) = Frame::parse(&[0x81, 0x00]).unwrap();
        assert_eq!(len, 2);
        assert_eq!(frame.payload(), b"");
    }

    #[test]
    fn test_validate_fragmented_control_frame() {
        let mut frame = Frame::ping(b"test".to_vec());
        frame.fin = false;
        assert!(matches!(
            frame.validate(),
            Err(Error::FragmentedControlFrame)
        ));
    }

    #[test]
    fn test_validate_control_frame_too_large() {
        let frame = Frame::ping(vec![0u8; 126]);
        assert!(matches!(
            frame.validate(),
            Err(Error::ControlFrameTooLarge(126))
        ));
    }

    #[test]
    fn test_validate_reserved_bits_set() {
        let mut frame = Frame::text(b"test".to_vec());
        frame.rsv1 = true;
        assert!(matches!(frame.validate(), Err(Error::ReservedBitsSet)));
    }

    #[test]
    fn test_parse_reserved_opcode() {
        assert!(matches!(
            Frame::parse(&[0x83, 0x00]),
            Err(Error::ReservedOpcode(0x03))
        ));
        assert!(matches!(
            Frame::parse(&[0x8b, 0x00]),
            Err(Error::ReservedOpcode(0x0B))
        ));
    }

    #[test]
    fn test_parse_incomplete_header() {
        assert!(matches!(
            Frame::parse(&[0x81]),
            Err(Error::IncompleteFrame { needed: 1 })
        ));
    }

    #[test]
    fn test_parse_incomplete_payload() {
        // len=5 but only 3 bytes of payload
        let data = &[0x81, 0x05, 0x48, 0x65, 0x6c];
        assert!(matches!(
            Frame::parse(data),
            Err(Error::IncompleteFrame { needed: 2 })
        ));
    }

    #[test]
    fn test_parse_incomplete_extended_lengths() {
        assert!(matches!(
            Frame::parse(&[0x82, 0x7e, 0x01]),
            Err(Error::IncompleteFrame { needed: 1 })
        ));
        assert!(matches!(
            Frame::parse(&[0x82, 0x7f, 0x00, 0x00, 0x00]),
            Err(Error::IncompleteFrame { needed: 5 })
        ));
    }

    #[test]
    fn test_parse_incomplete_mask_key() {
        let data = &[0x81, 0x85, 0x37, 0xfa];
        assert!(matches!(
            Frame::parse(data),
            Err(Error::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_write_unmasked_text_frame() {
        let frame = Frame::text(b"Hello".to_vec());
        let mut buf = vec![0u8; 32];

        let len = frame.write(&mut buf, None).unwrap();

        assert_eq!(len, 7);
        assert_eq!(&buf[..7], &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[test]
    fn test_write_masked_text_frame() {
        let frame = Frame::text(b"Hello".to_vec());
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = vec![0u8; 32];

        let len = frame.write(&mut buf, Some(mask)).unwrap();

        assert_eq!(len, 11);
        assert_eq!(buf[0], 0x81); // FIN + Text
        assert_eq!(buf[1], 0x85); // MASK + len=5
        assert_eq!(&buf[2..6], &mask);
        assert_eq!(&buf[6..11], &[0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_write_extended_length_126() {
        let frame = Frame::binary(vec![0xab; 256]);
        let mut buf = vec![0u8; 512];

        let len = frame.write(&mut buf, None).unwrap();

        assert_eq!(len, 4 + 256);
        assert_eq!(buf[1], 0x7e);
        assert_eq!(&buf[2..4], &[0x01, 0x00]);
    }

    #[test]
    fn test_roundtrip_masked() {
        let original = Frame::text(b"Masked roundtrip test!".to_vec());
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut buf = vec![0u8; 64];

        let written = original.write(&mut buf, Some(mask)).unwrap();
        let (parsed, consumed) = Frame::parse(&buf[..written]).unwrap();

        assert_eq!(consumed, written);
        assert_eq!(parsed.fin, original.fin);
        assert_eq!(parsed.opcode, original.opcode);
        assert_eq!(parsed.payload(), original.payload());
    }

    #[test]
    fn test_write_buffer_too_small() {
        let frame = Frame::text(b"Hello".to_vec());
        let mut buf = vec![0u8; 4];
        assert!(matches!(
            frame.write(&mut buf, None),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_wire_size() {
        let frame = Frame::text(b"Hello".to_vec());
        assert_eq!(frame.wire_size(false), 7);
        assert_eq!(frame.wire_size(true), 11);

        let frame = Frame::binary(vec![0u8; 256]);
        assert_eq!(frame.wire_size(false), 260);

        let frame = Frame::binary(vec![0u8; 65536]);
        assert_eq!(frame.wire_size(false), 65546);
    }

    #[test]
    fn test_close_frame_with_reason() {
        let frame = Frame::close(Some(1000), "Normal closure");
        let payload = frame.payload();
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);
        assert_eq!(&payload[2..], b"Normal closure");
    }

    #[test]
    fn test_frame_from_message() {
        let frame = Frame::from(Message::text("hi"));
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"hi");

        let frame = Frame::from(Message::close(crate::CloseCode::GoingAway, "bye"));
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(&frame.payload()[..2], &1001u16.to_be_bytes());
    }

    #[test]
    fn test_parse_rsv_bits_set() {
        // 0xc1 = FIN + RSV1 + Text
        let (frame, _) = Frame::parse(&[0xc1, 0x00]).unwrap();
        assert!(frame.rsv1);
        assert!(matches!(frame.validate(), Err(Error::ReservedBitsSet)));
    }

    #[test]
    fn test_payload_exceeds_platform_max() {
        // Header claiming u64::MAX payload must error, not panic.
        let mut data = vec![0x82, 0xFF];
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        assert!(Frame::parse(&data).is_err());
    }
}
