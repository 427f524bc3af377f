//! Length-delimited record framing with deadlines and cancellation.
//!
//! Each record on the wire is a 4-byte little-endian length followed by that
//! many payload bytes. Before any record is exchanged, each peer writes one
//! protocol VERSION byte and reads the peer's; a peer newer than
//! [`CURRENT_VERSION`](crate::CURRENT_VERSION) is rejected.
//!
//! Every raw I/O call carries a 2-second deadline. A timeout re-checks the
//! shutdown token and re-arms; after 5 consecutive timeouts the operation
//! fails with [`FrameError::DeadlineExhausted`] (or [`FrameError::Cancelled`]
//! if the token fired). There is no in-band keepalive: an idle peer
//! eventually exhausts the deadline and the connection is torn down.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{CURRENT_VERSION, error::FrameError};

/// Per-call I/O deadline.
pub const IO_DEADLINE: Duration = Duration::from_secs(2);

/// Consecutive deadline expiries tolerated before giving up (≈10 s).
pub const MAX_IO_TIMEOUTS: u32 = 5;

/// A byte stream carrying length-delimited records.
///
/// Owns the stream for the lifetime of the connection; dropping it closes
/// the socket with no partial frame recovery.
pub struct FramedStream<S> {
    stream: S,
    cancel: CancellationToken,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream. No bytes are exchanged yet.
    #[must_use]
    pub fn new(stream: S, cancel: CancellationToken) -> Self {
        Self { stream, cancel }
    }

    /// Exchange VERSION bytes: write ours, read the peer's.
    ///
    /// Returns the peer's version on success. Either side speaking a version
    /// newer than ours fails with [`FrameError::VersionMismatch`]; the caller
    /// is expected to drop the connection.
    pub async fn handshake(&mut self) -> Result<u8, FrameError> {
        self.write_deadline(&[CURRENT_VERSION]).await?;
        let mut peer = [0u8; 1];
        self.read_deadline(&mut peer).await?;
        if peer[0] > CURRENT_VERSION {
            return Err(FrameError::VersionMismatch {
                peer: peer[0],
                supported: CURRENT_VERSION,
            });
        }
        Ok(peer[0])
    }

    /// Read one record, rejecting payloads longer than `max_len`.
    pub async fn read_record(&mut self, max_len: usize) -> Result<Vec<u8>, FrameError> {
        let mut len_bytes = [0u8; 4];
        self.read_deadline(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > max_len {
            return Err(FrameError::RecordTooLarge { got: len, limit: max_len });
        }
        let mut payload = vec![0u8; len];
        self.read_deadline(&mut payload).await?;
        Ok(payload)
    }

    /// Write one record: length prefix, then payload.
    pub async fn write_record(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| FrameError::RecordTooLarge { got: payload.len(), limit: u32::MAX as usize })?;
        self.write_deadline(&len.to_le_bytes()).await?;
        self.write_deadline(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Fill `buf`, applying the deadline/cancellation policy per raw read.
    async fn read_deadline(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        let mut filled = 0;
        let mut timeouts = 0u32;
        while filled < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(FrameError::Cancelled);
            }
            match tokio::time::timeout(IO_DEADLINE, self.stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Err(FrameError::PeerClosed),
                Ok(Ok(n)) => {
                    filled += n;
                    timeouts = 0;
                },
                Ok(Err(err)) => return Err(FrameError::Io(err)),
                Err(_) => {
                    timeouts += 1;
                    if timeouts >= MAX_IO_TIMEOUTS {
                        return Err(self.deadline_error(timeouts));
                    }
                },
            }
        }
        Ok(())
    }

    /// Write all of `buf`, applying the deadline/cancellation policy.
    async fn write_deadline(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        let mut written = 0;
        let mut timeouts = 0u32;
        while written < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(FrameError::Cancelled);
            }
            match tokio::time::timeout(IO_DEADLINE, self.stream.write(&buf[written..])).await {
                Ok(Ok(0)) => return Err(FrameError::PeerClosed),
                Ok(Ok(n)) => {
                    written += n;
                    timeouts = 0;
                },
                Ok(Err(err)) => return Err(FrameError::Io(err)),
                Err(_) => {
                    timeouts += 1;
                    if timeouts >= MAX_IO_TIMEOUTS {
                        return Err(self.deadline_error(timeouts));
                    }
                },
            }
        }
        Ok(())
    }

    fn deadline_error(&self, timeouts: u32) -> FrameError {
        if self.cancel.is_cancelled() {
            FrameError::Cancelled
        } else {
            FrameError::DeadlineExhausted(timeouts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_REQUEST_FRAME;

    #[tokio::test]
    async fn records_round_trip_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = FramedStream::new(client, CancellationToken::new());
        let mut server = FramedStream::new(server, CancellationToken::new());

        client.write_record(b"first").await.unwrap();
        client.write_record(b"second").await.unwrap();
        client.write_record(b"").await.unwrap();

        assert_eq!(server.read_record(MAX_REQUEST_FRAME).await.unwrap(), b"first");
        assert_eq!(server.read_record(MAX_REQUEST_FRAME).await.unwrap(), b"second");
        assert_eq!(server.read_record(MAX_REQUEST_FRAME).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn handshake_agrees_on_current_version() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = FramedStream::new(client, CancellationToken::new());
        let mut server = FramedStream::new(server, CancellationToken::new());

        let (client_side, server_side) =
            tokio::join!(client.handshake(), server.handshake());
        assert_eq!(client_side.unwrap(), CURRENT_VERSION);
        assert_eq!(server_side.unwrap(), CURRENT_VERSION);
    }

    #[tokio::test]
    async fn handshake_rejects_newer_peer() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = FramedStream::new(server, CancellationToken::new());

        let driver = tokio::spawn(async move {
            let mut raw = client;
            // Peer speaks a future version before any framed record
            raw.write_all(&[CURRENT_VERSION + 1]).await.unwrap();
            let mut ours = [0u8; 1];
            raw.read_exact(&mut ours).await.unwrap();
        });

        let err = server.handshake().await.unwrap_err();
        assert!(matches!(err, FrameError::VersionMismatch { peer, .. } if peer == 2));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_record_is_rejected_before_read() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = FramedStream::new(server, CancellationToken::new());

        let driver = tokio::spawn(async move {
            let mut raw = client;
            raw.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        });

        let err = server.read_record(1024).await.unwrap_err();
        assert!(matches!(err, FrameError::RecordTooLarge { limit: 1024, .. }));
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_exhausts_deadline() {
        let (_client, server) = tokio::io::duplex(64);
        let mut server = FramedStream::new(server, CancellationToken::new());

        let err = server.read_record(1024).await.unwrap_err();
        assert!(matches!(err, FrameError::DeadlineExhausted(MAX_IO_TIMEOUTS)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_between_timeouts() {
        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut server = FramedStream::new(server, cancel.clone());

        let reader = tokio::spawn(async move { server.read_record(1024).await });
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}
