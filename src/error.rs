//! Error types for minibusd.

use thiserror::Error;

/// Result type alias for minibusd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the D-Bus broker.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listen address could not be parsed.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Wire-format error while decoding or encoding a message.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Client connection error.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Errors in the D-Bus address grammar.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The address has no `transport:` prefix.
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    /// The transport is not one the broker can listen on.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// A required key=value property is missing.
    #[error("Missing property '{property}' in {transport} address")]
    MissingProperty {
        transport: &'static str,
        property: &'static str,
    },

    /// A property value is not usable.
    #[error("Invalid value for '{property}': {value}")]
    InvalidProperty { property: &'static str, value: String },
}

/// Errors in the D-Bus wire format.
#[derive(Debug, Error)]
pub enum WireError {
    /// The message header is malformed.
    #[error("Invalid message header: {0}")]
    InvalidHeader(String),

    /// A type signature is malformed or unsupported.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Marshalled data does not match its signature.
    #[error("Invalid message data: {0}")]
    InvalidData(String),
}

/// Client connection errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Client violated the protocol before completing authentication.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}
