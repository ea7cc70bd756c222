//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// All of these are connection-scoped: the session sends an error reply when
/// the protocol defines one for the offending message kind, then closes the
/// connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message shorter than the common header or with malformed header fields
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: &'static str },

    /// Payload length inconsistent with what the header declares
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    /// Header declares a protocol version this server does not speak
    #[error("unsupported protocol version {version:#06x} (expected {expected:#06x})")]
    UnsupportedVersion { version: u16, expected: u16 },

    /// Header carries a command code outside the recognized set
    #[error("unknown command code {command:#06x}")]
    UnknownCommand { command: u16 },

    /// Structurally valid message that is illegal in the current session state
    #[error("message not valid in session state {state}")]
    InvalidState { state: &'static str },

    /// Declared transfer buffer exceeds the configured maximum
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Bus id does not fit the fixed wire field
    #[error("bus id too long: {len} bytes (max {max})")]
    BusIdTooLong { len: usize, max: usize },

    /// I/O error while reading or writing a message
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
