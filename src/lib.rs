//! # wschannels - WebSocket messaging with channel-based publish/subscribe
//!
//! `wschannels` upgrades HTTP connections to WebSocket (RFC 6455) and layers
//! a thread-safe channel registry on top, so any task can publish a message
//! to every connection subscribed to a named channel.
//!
//! ## Features
//!
//! - **Full duplex connections**: `send` from any task while the receive
//!   loop is blocked in `next_message`
//! - **RFC 6455 compliance** with strict frame validation and masking rules
//! - **Channel pub/sub**: scoped subscriptions, concurrent fan-out, failed
//!   subscribers swept automatically
//! - **Guaranteed teardown**: a connection is removed from every channel
//!   when its handler ends, panics included
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wschannels::{upgrade, Config, Message, Registry};
//!
//! let registry = Arc::new(Registry::new());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9001").await?;
//!
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let registry = Arc::clone(&registry);
//!     tokio::spawn(upgrade(stream, Config::default(), registry, |ws, registry| async move {
//!         let _room = registry.subscribe(&ws, ["lobby"]);
//!         while let Some(msg) = ws.next_message().await {
//!             registry.publish(["lobby"], msg).await;
//!         }
//!     }));
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod upgrade;

pub use config::{Config, Limits};
pub use connection::{ConnectionId, ConnectionState, Role, WebSocket};
pub use error::{Error, Result};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{compute_accept_key, HandshakeRequest, HandshakeResponse, OpCode, WS_GUID};
pub use registry::{Registry, Subscription};
pub use upgrade::upgrade;
