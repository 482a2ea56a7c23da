//! Configuration and limits for WebSocket connections.

use std::time::Duration;

/// Resource limits for WebSocket connections.
///
/// These limits prevent resource exhaustion attacks and ensure
/// bounded memory usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a single frame in bytes.
    ///
    /// Default: 16 MB (16 * 1024 * 1024)
    pub max_frame_size: usize,

    /// Maximum size of a complete message in bytes.
    ///
    /// This applies to the total size after reassembling all fragments.
    ///
    /// Default: 64 MB (64 * 1024 * 1024)
    pub max_message_size: usize,

    /// Maximum number of fragments in a single message.
    ///
    /// Default: 128
    pub max_fragment_count: usize,

    /// Maximum size of handshake data in bytes.
    ///
    /// Default: 8 KB (8192)
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_fragment_count: 128,
            max_handshake_size: 8192,
        }
    }
}

impl Limits {
    /// Create new limits with custom values.
    #[must_use]
    pub const fn new(
        max_frame_size: usize,
        max_message_size: usize,
        max_fragment_count: usize,
        max_handshake_size: usize,
    ) -> Self {
        Self {
            max_frame_size,
            max_message_size,
            max_fragment_count,
            max_handshake_size,
        }
    }

    /// Validate that message size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`](crate::Error::MessageTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_message_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_message_size {
            Err(crate::Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that frame size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`](crate::Error::FrameTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_frame_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_frame_size {
            Err(crate::Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that fragment count is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyFragments`](crate::Error::TooManyFragments) if `count` exceeds the configured maximum.
    pub const fn check_fragment_count(&self, count: usize) -> Result<(), crate::Error> {
        if count > self.max_fragment_count {
            Err(crate::Error::TooManyFragments {
                count,
                max: self.max_fragment_count,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that handshake size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeTooLarge`](crate::Error::HandshakeTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_handshake_size {
            Err(crate::Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }
}

/// WebSocket connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource limits.
    pub limits: Limits,

    /// Fragment size for outgoing messages (in bytes).
    ///
    /// Messages larger than this will be split into multiple frames.
    ///
    /// Default: 16 KB (16 * 1024)
    pub fragment_size: usize,

    /// Read buffer size (in bytes).
    ///
    /// Default: 8 KB (8192)
    pub read_buffer_size: usize,

    /// Keepalive ping interval.
    ///
    /// When set, the receive loop sends a ping at this interval and
    /// terminates the connection with a 1008 close if the previous ping
    /// was never answered with a pong. `None` (the default) disables
    /// keepalive entirely. A value of 25 seconds works well for detecting
    /// unresponsive clients without adding noticeable traffic.
    pub ping_interval: Option<Duration>,

    /// Idle read timeout.
    ///
    /// When set, a single blocking read that exceeds this duration counts
    /// as a transport error and terminates the connection. `None` (the
    /// default) waits indefinitely.
    pub read_timeout: Option<Duration>,

    /// Subprotocols supported by this endpoint.
    ///
    /// The handshake selects the first protocol offered by the client that
    /// appears in this list. Empty (the default) disables negotiation.
    pub subprotocols: Vec<String>,

    /// Allowed origins for CSWSH protection.
    ///
    /// If `Some`, only handshakes with an Origin header matching one of
    /// these values are accepted. If `None`, origin validation is disabled.
    /// Default: None
    pub allowed_origins: Option<Vec<String>>,

    /// Accept unmasked frames from clients (server only).
    ///
    /// RFC 6455 requires clients to mask all frames. Setting this to `true`
    /// violates the spec but may be useful for testing.
    ///
    /// Default: false
    pub accept_unmasked_frames: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            fragment_size: 16 * 1024,
            read_buffer_size: 8192,
            ping_interval: None,
            read_timeout: None,
            subprotocols: Vec::new(),
            allowed_origins: None,
            accept_unmasked_frames: false,
        }
    }
}

impl Config {
    /// Create a new configuration with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set fragment size for outgoing messages.
    #[must_use]
    pub const fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Set the idle read timeout.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the supported subprotocols.
    #[must_use]
    pub fn with_subprotocols(mut self, protocols: Vec<String>) -> Self {
        self.subprotocols = protocols;
        self
    }

    /// Set allowed origins for CSWSH protection.
    ///
    /// Only handshakes with an Origin header matching one of these values
    /// will be accepted.
    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Some(origins);
        self
    }

    /// Accept unmasked frames from clients (non-RFC compliant).
    #[must_use]
    pub const fn with_accept_unmasked_frames(mut self, accept: bool) -> Self {
        self.accept_unmasked_frames = accept;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(limits.max_message_size, 64 * 1024 * 1024);
        assert_eq!(limits.max_fragment_count, 128);
        assert_eq!(limits.max_handshake_size, 8192);
    }

    #[test]
    fn test_limits_checks() {
        let limits = Limits::default();
        assert!(limits.check_message_size(1024).is_ok());
        assert!(limits.check_message_size(100 * 1024 * 1024).is_err());
        assert!(limits.check_frame_size(1024).is_ok());
        assert!(limits.check_frame_size(20 * 1024 * 1024).is_err());
        assert!(limits.check_fragment_count(50).is_ok());
        assert!(limits.check_fragment_count(200).is_err());
        assert!(limits.check_handshake_size(1024).is_ok());
        assert!(limits.check_handshake_size(10000).is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.fragment_size, 16 * 1024);
        assert!(config.ping_interval.is_none());
        assert!(config.read_timeout.is_none());
        assert!(config.subprotocols.is_empty());
        assert!(config.allowed_origins.is_none());
        assert!(!config.accept_unmasked_frames);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .with_limits(Limits::new(1024, 4096, 8, 2048))
            .with_fragment_size(4096)
            .with_ping_interval(Duration::from_secs(25))
            .with_read_timeout(Duration::from_secs(60))
            .with_subprotocols(vec!["chat".into()]);

        assert_eq!(config.fragment_size, 4096);
        assert_eq!(config.limits.max_frame_size, 1024);
        assert_eq!(config.ping_interval, Some(Duration::from_secs(25)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.subprotocols, vec!["chat".to_string()]);
    }

    #[test]
    fn test_config_with_allowed_origins() {
        let origins = vec!["https://example.com".to_string()];
        let config = Config::new().with_allowed_origins(origins.clone());
        assert_eq!(config.allowed_origins, Some(origins));
    }
}
