//! # error
//!
//! Error types for the locking protocol core.

/// Errors that arise while decoding or interpreting wire traffic.
///
/// These never reach an application caller: per the protocol's error-handling
/// design, a malformed or unrecognized message is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to decode request: {0}")]
    Decode(String),

    #[error("unknown request type byte: {0}")]
    UnknownRequestType(u8),
}

/// Errors that can reach an application caller through the lock-service API.
#[derive(Debug, thiserror::Error)]
pub enum LockApiError {
    #[error("transport rejected outgoing request: {0}")]
    SendFailed(String),

    #[error("lock wait was interrupted before resolution")]
    Interrupted,
}
