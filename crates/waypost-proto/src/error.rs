//! Error types for packet codec and framed transport.
//!
//! [`ProtocolError`] covers structural problems in packet bytes; it never
//! depends on I/O. [`FrameError`] covers the transport layer: deadlines,
//! cancellation, peer behavior, and the underlying socket.

use thiserror::Error;

/// Errors from encoding or decoding packet bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the fixed header of the packet kind.
    #[error("packet too short: need at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared element counts do not match the actual byte length.
    #[error("packet length mismatch: declared layout needs {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Bytes the declared counts require
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// A count field exceeds its protocol cap.
    #[error("{field} count {got} exceeds protocol cap {cap}")]
    OverCap {
        /// Which count field overflowed
        field: &'static str,
        /// Declared value
        got: usize,
        /// Protocol cap
        cap: usize,
    },

    /// Version nibble is newer than this implementation supports.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// More than one request bit set, or an undefined bit set.
    #[error("invalid request flag combination {0:#04x}")]
    InvalidFlags(u8),

    /// Timestamp microseconds do not map to a representable instant.
    #[error("timestamp {0} out of representable range")]
    InvalidTimestamp(i64),

    /// UUID text is not 32 hex characters (bare or canonically hyphenated).
    #[error("malformed uuid {0:?}")]
    MalformedUuid(String),

    /// Control or response data is not valid UTF-8.
    #[error("data section is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors from the length-delimited framed transport.
#[derive(Debug, Error)]
pub enum FrameError {
    /// 2-second I/O deadline elapsed 5 consecutive times.
    #[error("i/o deadline exhausted after {0} consecutive timeouts")]
    DeadlineExhausted(u32),

    /// The process-wide shutdown signal fired.
    #[error("operation cancelled by shutdown signal")]
    Cancelled,

    /// Peer closed the stream mid-record.
    #[error("peer closed connection")]
    PeerClosed,

    /// Peer announced a protocol version newer than ours.
    #[error("peer protocol version {peer} exceeds supported version {supported}")]
    VersionMismatch {
        /// Version byte the peer sent
        peer: u8,
        /// Highest version we accept
        supported: u8,
    },

    /// Declared record length exceeds the caller's cap.
    #[error("framed record of {got} bytes exceeds limit {limit}")]
    RecordTooLarge {
        /// Declared payload length
        got: usize,
        /// Cap supplied by the caller
        limit: usize,
    },

    /// Non-timeout socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True when the connection failed because of the shutdown signal rather
    /// than peer or network behavior.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::OverCap { field: "logs", got: 300, cap: 256 };
        assert_eq!(err.to_string(), "logs count 300 exceeds protocol cap 256");

        let err = ProtocolError::LengthMismatch { expected: 43, actual: 23 };
        assert_eq!(
            err.to_string(),
            "packet length mismatch: declared layout needs 43 bytes, got 23"
        );
    }

    #[test]
    fn cancelled_is_distinguished() {
        assert!(FrameError::Cancelled.is_cancelled());
        assert!(!FrameError::DeadlineExhausted(5).is_cancelled());
        assert!(!FrameError::PeerClosed.is_cancelled());
    }
}
