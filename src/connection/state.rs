//! WebSocket connection state machine.

/// WebSocket connection state.
///
/// A connection is constructed in `Open` (the handshake has already
/// completed by then) and moves monotonically through `Closing` to
/// `Closed`. The discriminant values encode that ordering so the state
/// can live in an atomic advanced with `fetch_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Connection is open and ready for data transfer.
    #[default]
    Open = 0,
    /// Close handshake initiated, waiting for peer's close frame.
    Closing = 1,
    /// Connection is fully closed.
    Closed = 2,
}

impl ConnectionState {
    /// Decode a state from its atomic representation.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Encode the state for atomic storage.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if sending data is allowed in this state.
    ///
    /// Returns `true` only for `Open` state.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Check if receiving data is allowed in this state.
    ///
    /// Returns `true` for `Open` or `Closing` states.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}
