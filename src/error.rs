//! # Error Types
//!
//! Comprehensive error handling for the Conduit protocol.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O failures to request-scoped RPC errors.
//!
//! ## Error Categories
//! - **Transport errors**: peer closed, timeouts, local I/O failures
//! - **Protocol errors**: bad magic, unsupported versions, oversized frames
//! - **Authentication errors**: rejected credentials, handshake timeouts
//! - **Request errors**: unknown methods, invalid parameters, handler failures
//!
//! Anything that compromises frame-stream integrity is fatal to its
//! connection; anything scoped to a single request is wrapped in an
//! RPC_ERROR envelope and leaves the connection healthy. [`ConduitError::code`]
//! maps request-scoped errors onto the numeric taxonomy carried on the wire.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Router-related error messages
    pub const ERR_ROUTER_WRITE_LOCK: &str = "Failed to acquire write lock on router";
    pub const ERR_ROUTER_READ_LOCK: &str = "Failed to acquire read lock on router";

    /// Protocol validation errors
    pub const ERR_INVALID_HEADER: &str = "Invalid frame header";
    pub const ERR_OVERSIZED_FRAME: &str = "Frame exceeds maximum size";
    pub const ERR_RESERVED_FLAGS: &str = "Reserved flag bits set";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_HEARTBEAT_TIMEOUT: &str = "Heartbeat deadline exceeded";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Authentication errors
    pub const ERR_AUTH_BAD_PASSWORD: &str = "Password hash mismatch";
    pub const ERR_AUTH_UNEXPECTED_FRAME: &str = "Expected AUTH_REQUEST frame";
    pub const ERR_AUTH_TIMEOUT: &str = "Authentication timed out";

    /// System errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

/// Numeric error codes carried in RPC_ERROR envelopes.
pub mod codes {
    /// Unexpected handler failure
    pub const HANDLER_ERROR: u16 = 1001;
    /// Parameter payload is not a map
    pub const VALIDATION: u16 = 2000;
    /// Required parameter missing
    pub const MISSING_PARAM: u16 = 2001;
    /// Parameter present but wrongly typed
    pub const INVALID_PARAM_TYPE: u16 = 2002;
    /// Authentication rejected
    pub const AUTH_FAILED: u16 = 3001;
    /// No RPC method registered under the requested name
    pub const METHOD_NOT_FOUND: u16 = 4000;
    /// Parameters rejected by the method schema
    pub const INVALID_PARAMS: u16 = 4001;
    /// Send/receive attempted outside an active connection, or the
    /// connection failed while a call was pending
    pub const NOT_CONNECTED: u16 = 5000;
    /// RPC call deadline expired
    pub const RPC_TIMEOUT: u16 = 5001;
    /// Reserved for future flow-control rejection
    pub const RATE_LIMITED: u16 = 6000;
}

// ConduitError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Reserved flag bits set: {0:#06x}")]
    ReservedFlags(u16),

    #[error("Encrypted frames are not supported")]
    EncryptionUnsupported,

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String, retry_allowed: bool },

    #[error("Illegal state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not connected")]
    NotConnected,

    #[error("RPC call timed out")]
    RpcTimeout,

    #[error("Connection lost while call was pending")]
    ConnectionLost,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required parameter: {0}")]
    MissingParam(String),

    #[error("Invalid parameter type: {0}")]
    InvalidParamType(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ConduitError {
    /// Numeric code for the RPC_ERROR envelope, where one is defined.
    ///
    /// Transport and protocol-integrity errors are fatal to the
    /// connection and never travel in an envelope, so they have none.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed { .. } => Some(codes::AUTH_FAILED),
            Self::NotConnected | Self::ConnectionLost => Some(codes::NOT_CONNECTED),
            Self::RpcTimeout => Some(codes::RPC_TIMEOUT),
            Self::Validation(_) => Some(codes::VALIDATION),
            Self::MissingParam(_) => Some(codes::MISSING_PARAM),
            Self::InvalidParamType(_) => Some(codes::INVALID_PARAM_TYPE),
            Self::MethodNotFound(_) => Some(codes::METHOD_NOT_FOUND),
            Self::InvalidParams(_) => Some(codes::INVALID_PARAMS),
            Self::Handler(_) => Some(codes::HANDLER_ERROR),
            _ => None,
        }
    }

    /// Whether this error compromises frame-stream integrity and must
    /// fail the connection, as opposed to a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::InvalidHeader
                | Self::UnsupportedVersion(_)
                | Self::OversizedFrame(_)
                | Self::ReservedFlags(_)
                | Self::EncryptionUnsupported
                | Self::Decode(_)
                | Self::DecompressionFailure
                | Self::AuthenticationFailed { .. }
        )
    }
}

/// Type alias for Results using ConduitError
pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_scoped_errors_have_codes() {
        assert_eq!(
            ConduitError::MethodNotFound("nope".into()).code(),
            Some(codes::METHOD_NOT_FOUND)
        );
        assert_eq!(
            ConduitError::InvalidParams("bad".into()).code(),
            Some(codes::INVALID_PARAMS)
        );
        assert_eq!(ConduitError::RpcTimeout.code(), Some(codes::RPC_TIMEOUT));
        assert_eq!(
            ConduitError::ConnectionLost.code(),
            Some(codes::NOT_CONNECTED)
        );
    }

    #[test]
    fn integrity_errors_are_fatal_and_codeless() {
        let err = ConduitError::InvalidHeader;
        assert!(err.is_fatal());
        assert_eq!(err.code(), None);

        let err = ConduitError::OversizedFrame(20_000_000);
        assert!(err.is_fatal());
        assert_eq!(err.code(), None);
    }

    #[test]
    fn request_errors_are_not_fatal() {
        assert!(!ConduitError::MethodNotFound("x".into()).is_fatal());
        assert!(!ConduitError::Handler("boom".into()).is_fatal());
        assert!(!ConduitError::RpcTimeout.is_fatal());
    }
}
