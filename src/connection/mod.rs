//! WebSocket connection management and state machine.
//!
//! The central type is [`WebSocket`]: one instance per upgraded connection,
//! shared behind an `Arc` so the registry can deliver published messages
//! while the connection's own task sits in the receive loop.
//!
//! ## Connection Lifecycle
//!
//! 1. **Open** - initial state after successful handshake
//! 2. **Closing** - close frame sent, waiting for peer close
//! 3. **Closed** - connection fully closed
//!
//! Transitions are monotonic; there is no way back from Closing or Closed.

mod fragmenter;
mod role;
mod state;
mod websocket;

pub use role::Role;
pub use state::ConnectionState;
pub use websocket::{ConnectionId, WebSocket};
