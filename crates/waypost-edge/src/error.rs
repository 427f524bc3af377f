//! Edge client error types.

use thiserror::Error;
use waypost_proto::{FrameError, ProtocolError};

/// Errors from the edge client.
///
/// Session errors tear the connection down and send the client back to
/// DISCONNECTED with backoff; configuration errors are fatal at startup.
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Bad configuration (certificate paths, UUID, host).
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP or TLS dial failure.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Framed-transport failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Malformed packet bytes from the server.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Server answered with INVALID or INTERNAL_FAILURE.
    #[error("server rejected request with flags {0:#06x}")]
    ServerRejected(u16),

    /// Server response did not fit the request that prompted it.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Dispatched control payload could not be parsed.
    #[error("malformed control payload: {0}")]
    ControlPayload(String),

    /// The scan-record channel closed; the producer is gone.
    #[error("scanner channel closed")]
    ScannerClosed,
}
