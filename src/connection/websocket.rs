//! The per-connection duplex messaging state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::Config;
use crate::connection::fragmenter::MessageFragmenter;
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::{Frame, MessageAssembler, OpCode};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection within this process.
///
/// Assigned from a process-global counter when the `WebSocket` is
/// constructed; used as the identity key in registry subscriber sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything the receive loop owns: the read half, reassembly state and
/// the next keepalive ping deadline.
struct Receiver {
    reader: FrameReader<BoxedRead>,
    assembler: MessageAssembler,
    ping_deadline: Option<Instant>,
}

#[derive(Clone, Copy)]
enum Expiry {
    Ping,
    ReadTimeout,
}

fn close_code_for(err: &Error) -> CloseCode {
    match err {
        Error::MessageTooLarge { .. }
        | Error::FrameTooLarge { .. }
        | Error::TooManyFragments { .. } => CloseCode::MessageTooBig,
        Error::InvalidUtf8 => CloseCode::InvalidPayload,
        _ => CloseCode::ProtocolError,
    }
}

fn parse_close_frame(frame: &Frame) -> Option<CloseFrame> {
    let payload = frame.payload();
    if payload.len() >= 2 {
        let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
        // RFC 6455 Section 7.4.1: codes that may not appear on the wire
        // (reserved or out of range) are answered with 1002.
        if !code.is_valid() {
            return Some(CloseFrame::new(CloseCode::ProtocolError, ""));
        }
        match std::str::from_utf8(&payload[2..]) {
            Ok(reason) => Some(CloseFrame::new(code, reason)),
            Err(_) => Some(CloseFrame::new(CloseCode::InvalidPayload, "")),
        }
    } else if payload.is_empty() {
        None
    } else {
        Some(CloseFrame::new(
            CloseCode::ProtocolError,
            "Invalid close frame",
        ))
    }
}

/// A WebSocket connection after a completed handshake.
///
/// The read half and the write half sit behind independent async mutexes,
/// so `send` can be called from any task concurrently with a task blocked
/// in [`next_message`](Self::next_message). The connection state is a
/// monotonic atomic: Open, then Closing, then Closed, never backwards.
///
/// ## Example
///
/// ```rust,ignore
/// while let Some(msg) = ws.next_message().await {
///     ws.send(msg).await?; // echo
/// }
/// // the message sequence has ended; the connection is closed
/// ```
pub struct WebSocket {
    id: ConnectionId,
    receiver: Mutex<Receiver>,
    writer: Mutex<FrameWriter<BoxedWrite>>,
    state: AtomicU8,
    pong_received: AtomicBool,
    subprotocol: Option<String>,
    config: Config,
}

impl WebSocket {
    /// Create a connection from pre-split stream halves.
    pub fn new<R, W>(read: R, write: W, role: Role, config: Config) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_subprotocol(read, write, role, config, None)
    }

    /// Create a connection with a negotiated subprotocol.
    pub fn with_subprotocol<R, W>(
        read: R,
        write: W,
        role: Role,
        config: Config,
        subprotocol: Option<String>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader = FrameReader::new(Box::new(read) as BoxedRead, role, &config);
        let writer = FrameWriter::new(Box::new(write) as BoxedWrite, role, &config);
        let assembler = MessageAssembler::new(config.limits.clone());
        Self {
            id: ConnectionId::next(),
            receiver: Mutex::new(Receiver {
                reader,
                assembler,
                ping_deadline: None,
            }),
            writer: Mutex::new(writer),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            // No ping is outstanding yet, so liveness starts satisfied.
            pong_received: AtomicBool::new(true),
            subprotocol,
            config,
        }
    }

    /// Create a connection by splitting a duplex stream.
    pub fn from_stream<T>(stream: T, role: Role, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::new(read, write, role, config)
    }

    /// The process-unique identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether messages can currently be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The subprotocol accepted during the handshake, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Advance the state, never backwards. Returns the previous state.
    fn transition(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.fetch_max(to.as_u8(), Ordering::AcqRel))
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_frame(frame).await {
            self.transition(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the connection after a local error: best-effort close
    /// frame if the peer never saw one, then straight to Closed.
    async fn abort(&self, code: CloseCode, reason: &str) {
        let prev = self.transition(ConnectionState::Closed);
        if prev == ConnectionState::Open {
            let frame = Frame::close(Some(code.as_u16()), reason);
            let mut writer = self.writer.lock().await;
            let _ = writer.write_frame(&frame).await;
        }
    }

    /// Send a message.
    ///
    /// Data messages above `fragment_size` are split into a fragment train.
    /// The writer lock serializes concurrent senders, so the fragments of
    /// one message are never interleaved with another.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed` if the connection is not open
    /// - `Error::MessageTooLarge` if the payload exceeds the limit
    /// - `Error::Io` if the write fails; the connection is Closed after this
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.state().can_send() {
            return Err(Error::ConnectionClosed(None));
        }

        // Control frames are never fragmented
        if message.is_control() {
            let frame = Frame::from(message);
            return self.write_frame(&frame).await;
        }

        self.config
            .limits
            .check_message_size(message.payload().len())?;

        let opcode = if message.is_text() {
            OpCode::Text
        } else {
            OpCode::Binary
        };

        let mut writer = self.writer.lock().await;

        if message.payload().len() <= self.config.fragment_size {
            let frame = Frame::from(message);
            if let Err(e) = writer.write_frame(&frame).await {
                self.transition(ConnectionState::Closed);
                return Err(e);
            }
        } else {
            for frame in
                MessageFragmenter::new(message.payload(), opcode, self.config.fragment_size)
            {
                if let Err(e) = writer.write_frame(&frame).await {
                    self.transition(ConnectionState::Closed);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Initiate the close handshake.
    ///
    /// Idempotent: the first call on an open connection sends a close frame
    /// and moves to Closing; any later call is a no-op. The receive loop
    /// finishes the handshake when the peer's close frame arrives.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCloseCode` if the code is reserved for the protocol
    /// - `Error::Io` if the close frame cannot be written
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if code.is_reserved() {
            return Err(Error::InvalidCloseCode(code.as_u16()));
        }

        let open = ConnectionState::Open.as_u8();
        let closing = ConnectionState::Closing.as_u8();
        if self
            .state
            .compare_exchange(open, closing, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        debug!(id = %self.id, code = code.as_u16(), "closing connection");
        let frame = Frame::close(Some(code.as_u16()), reason);
        self.write_frame(&frame).await
    }

    /// Receive the next data message.
    ///
    /// Pings are answered with pongs, pongs feed the keepalive, fragments
    /// are reassembled; none of those surface here. Returns `None` when the
    /// message sequence has ended, after a close handshake, transport loss
    /// or a protocol error (which also sends a best-effort abnormal close).
    /// Once `None` has been returned every later call returns `None`
    /// immediately.
    pub async fn next_message(&self) -> Option<Message> {
        loop {
            if !self.state().can_receive() {
                return None;
            }

            let mut rx = self.receiver.lock().await;

            // Pick the earliest of the keepalive ping deadline and the
            // idle read timeout, if either is configured.
            let mut deadline: Option<(Instant, Expiry)> = None;
            if let Some(interval) = self.config.ping_interval {
                let at = *rx
                    .ping_deadline
                    .get_or_insert_with(|| Instant::now() + interval);
                deadline = Some((at, Expiry::Ping));
            }
            if let Some(timeout) = self.config.read_timeout {
                let at = Instant::now() + timeout;
                if deadline.map_or(true, |(other, _)| at < other) {
                    deadline = Some((at, Expiry::ReadTimeout));
                }
            }

            let result = match deadline {
                None => rx.reader.read_frame().await,
                Some((at, expiry)) => match tokio::time::timeout_at(at, rx.reader.read_frame())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => match expiry {
                        Expiry::ReadTimeout => Err(Error::ReadTimeout),
                        Expiry::Ping => {
                            if !self.pong_received.swap(false, Ordering::AcqRel) {
                                warn!(id = %self.id, "keepalive pong not received");
                                drop(rx);
                                self.abort(CloseCode::PolicyViolation, "keepalive timeout")
                                    .await;
                                return None;
                            }
                            if self.write_frame(&Frame::ping(Vec::new())).await.is_err() {
                                return None;
                            }
                            if let Some(interval) = self.config.ping_interval {
                                rx.ping_deadline = Some(Instant::now() + interval);
                            }
                            continue;
                        }
                    },
                },
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(Error::ConnectionClosed(_)) => {
                    debug!(id = %self.id, "transport closed by peer");
                    self.transition(ConnectionState::Closed);
                    return None;
                }
                Err(e) if e.is_protocol_violation() => {
                    warn!(id = %self.id, error = %e, "protocol violation");
                    drop(rx);
                    self.abort(close_code_for(&e), "protocol error").await;
                    return None;
                }
                Err(e) => {
                    debug!(id = %self.id, error = %e, "read failed");
                    self.transition(ConnectionState::Closed);
                    return None;
                }
            };

            if let Err(e) = frame.validate() {
                warn!(id = %self.id, error = %e, "invalid frame");
                drop(rx);
                self.abort(close_code_for(&e), "protocol error").await;
                return None;
            }

            match frame.opcode {
                OpCode::Ping => {
                    let pong = Frame::pong(frame.into_payload());
                    if self.write_frame(&pong).await.is_err() {
                        return None;
                    }
                }
                OpCode::Pong => {
                    self.pong_received.store(true, Ordering::Release);
                }
                OpCode::Close => {
                    let close_frame = parse_close_frame(&frame);
                    let prev = self.transition(ConnectionState::Closing);
                    if prev == ConnectionState::Open {
                        let echo = match &close_frame {
                            Some(cf) => Frame::close(Some(cf.code.as_u16()), &cf.reason),
                            None => Frame::close(None, ""),
                        };
                        let mut writer = self.writer.lock().await;
                        let _ = writer.write_frame(&echo).await;
                    }
                    self.transition(ConnectionState::Closed);
                    debug!(id = %self.id, "close handshake complete");
                    return None;
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match rx.assembler.push(frame) {
                        Ok(Some(message)) => return Some(message),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(id = %self.id, error = %e, "message reassembly failed");
                            drop(rx);
                            self.abort(close_code_for(&e), "protocol error").await;
                            return None;
                        }
                    }
                }
            }
        }
    }
}
