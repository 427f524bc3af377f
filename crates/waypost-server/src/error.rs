//! Server error types.

use thiserror::Error;
use waypost_proto::{FrameError, ProtocolError};
use waypost_store::StoreError;

/// Errors from server operations.
///
/// Only the per-connection handler converts these into response flags;
/// everything below it propagates the structured error.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad configuration (certificate paths, bind address).
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS or TCP failure outside an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Framed-transport failure on an established connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Malformed packet bytes.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
