//! Shared test harness: a real TCP listener on an ephemeral port and a
//! handshaking client built from the public API.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wschannels::{
    compute_accept_key, CloseCode, Config, Error, HandshakeRequest, HandshakeResponse, Message,
    Result, Role, WebSocket,
};

/// Bind a listener on an ephemeral local port.
pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn read_response_head<T>(io: &mut T) -> Result<(Vec<u8>, Vec<u8>)>
where
    T: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(pos + 4).to_vec();
            return Ok((head, buf.to_vec()));
        }
        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::InvalidHandshake(
                "Connection closed during handshake".into(),
            ));
        }
    }
}

/// A client-side WebSocket connection for driving a server under test.
pub struct TestClient {
    pub ws: Arc<WebSocket>,
    pub response: HandshakeResponse,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, Config::default(), Vec::new()).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        config: Config,
        protocols: Vec<String>,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;

        let mut request = HandshakeRequest::new("/ws", addr.to_string());
        request.protocols = protocols;
        let mut buf = Vec::new();
        request.write(&mut buf);
        stream.write_all(&buf).await?;

        let (head, leftover) = read_response_head(&mut stream).await?;
        let response = HandshakeResponse::parse(&head)?;
        if response.accept != compute_accept_key(&request.key) {
            return Err(Error::InvalidHandshake(
                "Sec-WebSocket-Accept mismatch".into(),
            ));
        }

        let (read, write) = tokio::io::split(stream);
        let read = std::io::Cursor::new(leftover).chain(read);
        let ws = Arc::new(WebSocket::with_subprotocol(
            read,
            write,
            Role::Client,
            config,
            response.protocol.clone(),
        ));
        Ok(Self { ws, response })
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.ws.send(Message::text(text)).await
    }

    pub async fn recv(&self) -> Option<Message> {
        self.ws.next_message().await
    }

    pub async fn recv_text(&self) -> Option<String> {
        self.ws.next_message().await.and_then(Message::into_text)
    }

    pub async fn close(&self) -> Result<()> {
        self.ws.close(CloseCode::Normal, "test done").await
    }
}
