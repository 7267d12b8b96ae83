//! Error types for noderelay.

use thiserror::Error;

/// Result type alias for noderelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, probing, routing or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration input
    #[error("configuration error: {0}")]
    Config(String),

    /// No node survived the selection filter
    #[error("no available node")]
    NoAvailableNode,

    /// Tunnel handshake failed at the transport level
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The remote node rejected the session or could not decrypt it
    #[error("authentication failed")]
    Authentication,

    /// Malformed inbound proxy request or tunnel payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A tunnel frame failed AEAD verification
    #[error("frame authentication failed at sequence {0}")]
    FrameAuthentication(u64),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Cipher identifier not supported by the tunnel
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Operation deadline elapsed
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Name resolution failed
    #[error("dns error: {0}")]
    Dns(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Check if a failed tunnel open should be retried against another node
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_) | Error::Authentication | Error::Timeout(_) | Error::Network(_)
        )
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication | Error::FrameAuthentication(_))
    }
}
