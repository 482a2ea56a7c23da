//! Buffered frame I/O over split stream halves.
//!
//! [`FrameReader`] and [`FrameWriter`] each own one half of the transport so
//! the connection can read and write concurrently from different tasks.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Generate a random seed for mask generation.
/// Falls back to system time if getrandom fails.
fn random_mask_seed() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        u32::from_le_bytes(buf)
    } else {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(0x12345678)
    }
}

/// Reads frames from the receive half of the transport.
///
/// Incoming frames are validated before parsing completes: masking direction
/// per role (RFC 6455 Section 5.1), reserved bits, and the configured frame
/// size limit.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    role: Role,
    max_frame_size: usize,
    accept_unmasked_frames: bool,
}

impl<R> FrameReader<R> {
    #[must_use]
    pub fn new(io: R, role: Role, config: &Config) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(config.read_buffer_size),
            role,
            max_frame_size: config.limits.max_frame_size,
            accept_unmasked_frames: config.accept_unmasked_frames,
        }
    }

    /// Validate frame metadata extracted from the raw header.
    ///
    /// Masking is checked first: a frame with the wrong masking direction is
    /// rejected before anything else is inspected.
    fn validate_incoming(
        &self,
        masked: bool,
        rsv1: bool,
        rsv2: bool,
        rsv3: bool,
        payload_len: usize,
    ) -> Result<()> {
        match self.role {
            Role::Server => {
                if !masked && !self.accept_unmasked_frames {
                    return Err(Error::UnmaskedClientFrame);
                }
            }
            Role::Client => {
                if masked {
                    return Err(Error::MaskedServerFrame);
                }
            }
        }

        if rsv1 || rsv2 || rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if payload_len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next complete frame.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed` if the transport reached EOF mid-stream
    /// - masking / RSV / size violations from inbound validation
    /// - `Error::Io` on transport failure
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if self.buf.len() >= 2 {
                // Validate frame before parsing (metadata from raw buffer)
                let byte0 = self.buf[0];
                let byte1 = self.buf[1];
                let rsv1 = (byte0 & 0x40) != 0;
                let rsv2 = (byte0 & 0x20) != 0;
                let rsv3 = (byte0 & 0x10) != 0;
                let masked = (byte1 & 0x80) != 0;
                let payload_len_initial = byte1 & 0x7F;

                let payload_len = match payload_len_initial {
                    0..=125 => Some(payload_len_initial as usize),
                    126 if self.buf.len() >= 4 => {
                        Some(u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize)
                    }
                    127 if self.buf.len() >= 10 => Some(u64::from_be_bytes([
                        self.buf[2],
                        self.buf[3],
                        self.buf[4],
                        self.buf[5],
                        self.buf[6],
                        self.buf[7],
                        self.buf[8],
                        self.buf[9],
                    ]) as usize),
                    _ => None,
                };

                if let Some(len) = payload_len {
                    self.validate_incoming(masked, rsv1, rsv2, rsv3, len)?;
                }

                match Frame::parse(&self.buf) {
                    Ok((frame, consumed)) => {
                        self.buf.advance(consumed);
                        return Ok(frame);
                    }
                    Err(Error::IncompleteFrame { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed(None));
            }
        }
    }
}

/// Writes frames to the send half of the transport.
///
/// Client-role writers mask every outgoing frame with a fresh key derived
/// from a getrandom-seeded counter.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
    role: Role,
    mask_counter: u32,
}

impl<W> FrameWriter<W> {
    #[must_use]
    pub fn new(io: W, role: Role, config: &Config) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(config.read_buffer_size),
            role,
            mask_counter: random_mask_seed(),
        }
    }

    fn generate_mask(&mut self) -> [u8; 4] {
        self.mask_counter = self.mask_counter.wrapping_add(0x9E37_79B9);
        let a = self.mask_counter;
        let b = a.wrapping_mul(0x85EB_CA6B);
        let c = b ^ (b >> 13);
        let d = c.wrapping_mul(0xC2B2_AE35);
        d.to_le_bytes()
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write a single frame and flush it to the transport.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on transport failure.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = if self.role.must_mask() {
            Some(self.generate_mask())
        } else {
            None
        };

        let wire_size = frame.wire_size(mask.is_some());
        self.buf.clear();
        self.buf.resize(wire_size, 0);

        let written = frame.write(&mut self.buf, mask)?;
        self.io.write_all(&self.buf[..written]).await?;
        self.io.flush().await?;
        Ok(())
    }
}
