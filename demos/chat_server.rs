//! Chat room server: every connection joins the "lobby" channel and each
//! text message is published to everyone in the room.
//!
//! Run with: cargo run --example chat_server
//! Then connect a few WebSocket clients to ws://127.0.0.1:9001/

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use wschannels::{upgrade, Config, Message, Registry};

const ADDR: &str = "127.0.0.1:9001";
const ROOM: &str = "lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_server=info,wschannels=debug".into()),
        )
        .init();

    let registry = Arc::new(Registry::new());
    let listener = TcpListener::bind(ADDR).await?;
    info!(addr = ADDR, "chat server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            let result = upgrade(stream, Config::default(), registry, |ws, registry| {
                async move {
                    info!(id = %ws.id(), "joined the lobby");
                    let _membership = registry.subscribe(&ws, [ROOM]);
                    let name = format!("guest-{}", ws.id());

                    while let Some(msg) = ws.next_message().await {
                        if let Some(text) = msg.as_text() {
                            let line = format!("{name}: {text}");
                            registry.publish([ROOM], Message::text(line)).await;
                        }
                    }
                    info!(id = %ws.id(), "left the lobby");
                }
            })
            .await;

            if let Err(e) = result {
                info!(%addr, error = %e, "connection rejected");
            }
        });
    }
}
