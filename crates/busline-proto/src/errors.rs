//! Error types for the busline wire vocabulary.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Protocol-level errors raised while formatting handshake lines or
/// encoding/decoding message frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Frame errors
    /// First header byte is not the big-endian marker
    #[error("invalid endianness marker: {0:#04x}")]
    InvalidEndianness(u8),

    /// Unsupported frame version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown message kind
    #[error("invalid message kind: {0}")]
    InvalidKind(u8),

    /// Message carries serial 0, which is reserved for "no reply expected"
    #[error("message serial must be non-zero")]
    ZeroSerial,

    /// Body exceeds maximum allowed size
    #[error("body too large: {size} bytes exceeds maximum {max}")]
    BodyTooLarge {
        /// Actual body size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // Handshake errors
    /// Handshake line argument would break line framing
    #[error("invalid handshake line: {0}")]
    InvalidLine(String),
}

/// Convenient Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
