//! HTTP Upgrade entry point.
//!
//! [`upgrade`] takes a raw accepted stream, performs the WebSocket
//! handshake, hands the resulting connection to the caller's handler, and
//! guarantees teardown afterwards: the connection is removed from every
//! registry channel, a best-effort close is sent, and the transport is
//! dropped. A panicking handler is contained and treated like a normal
//! handler exit.

use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{Role, WebSocket};
use crate::error::{Error, Result};
use crate::message::CloseCode;
use crate::protocol::handshake::{validate_origin, HandshakeRequest, HandshakeResponse};
use crate::registry::Registry;

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Read the HTTP request head up to the blank line.
///
/// Returns the head (terminator included) and any bytes that arrived after
/// it; those belong to the frame stream and must not be discarded.
pub(crate) async fn read_head<T>(io: &mut T, max_size: usize) -> Result<(Vec<u8>, Vec<u8>)>
where
    T: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(pos + 4).to_vec();
            return Ok((head, buf.to_vec()));
        }

        if buf.len() > max_size {
            return Err(Error::HandshakeTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }

        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::InvalidHandshake(
                "Connection closed during handshake".into(),
            ));
        }
    }
}

fn parse_and_validate(head: &[u8], config: &Config) -> Result<HandshakeRequest> {
    let request = HandshakeRequest::parse(head)?;
    request.validate()?;
    if let Some(allowed) = &config.allowed_origins {
        validate_origin(request.origin.as_deref(), allowed)?;
    }
    Ok(request)
}

/// Upgrade an accepted stream to a WebSocket connection and run `handler`
/// on it.
///
/// On a valid handshake the `101 Switching Protocols` response is written,
/// a shared [`WebSocket`] is constructed in the Open state, and the handler
/// runs as its own task. Whatever way the handler ends, the connection is
/// swept from the registry and closed before this function returns, so a
/// closed connection is never left in a subscription set.
///
/// On a rejected handshake a plain `400 Bad Request` is written and the
/// error is returned; no connection is constructed.
///
/// # Errors
///
/// Handshake parse/validation errors, origin rejection, or transport errors
/// while reading the request or writing the response. Handler failures are
/// logged, never propagated.
pub async fn upgrade<T, H, F>(
    mut stream: T,
    config: Config,
    registry: Arc<Registry>,
    handler: H,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: FnOnce(Arc<WebSocket>, Arc<Registry>) -> F,
    F: Future<Output = ()> + Send + 'static,
{
    let head = match read_head(&mut stream, config.limits.max_handshake_size).await {
        Ok(head) => head,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };
    let (head, leftover) = head;

    let request = match parse_and_validate(&head, &config) {
        Ok(request) => request,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };

    let response = HandshakeResponse::from_request(&request, &config.subprotocols);
    let mut response_buf = Vec::new();
    response.write(&mut response_buf)?;
    stream.write_all(&response_buf).await?;
    stream.flush().await?;

    let (read, write) = tokio::io::split(stream);
    // Bytes that arrived behind the request head are the first frames.
    let read = std::io::Cursor::new(leftover).chain(read);
    let ws = Arc::new(WebSocket::with_subprotocol(
        read,
        write,
        Role::Server,
        config,
        response.protocol,
    ));
    let id = ws.id();
    debug!(id = %id, path = %request.path, subprotocol = ?ws.subprotocol(), "connection upgraded");

    let task = tokio::spawn(handler(Arc::clone(&ws), Arc::clone(&registry)));
    if let Err(e) = task.await {
        if e.is_panic() {
            warn!(id = %id, "connection handler panicked");
        }
    }

    registry.remove_connection(id);
    let _ = ws.close(CloseCode::Normal, "").await;
    debug!(id = %id, "connection torn down");
    Ok(())
}
