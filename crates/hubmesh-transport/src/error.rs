//! Error taxonomy for the hubmesh transport layer.

use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Frame-level problems (`InvalidFrame`, `Serialization`) are recoverable:
/// the offending frame is logged and discarded while the connection stays
/// up. IO errors tear the link down and trigger the client's redial loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection attempt did not complete within the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was being dialed.
        addr: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// Operation requires a live connection and there is none.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A frame did not match any known wire shape.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Why the frame was rejected.
        reason: String,
    },

    /// A frame exceeded the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Observed frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the error invalidates the connection (IO / close), as
    /// opposed to a single bad frame that can be skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::ConnectionClosed
        )
    }
}

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
