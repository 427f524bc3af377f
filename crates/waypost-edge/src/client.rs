//! Edge client control loop.
//!
//! State machine: DISCONNECTED → CONNECTING → HANDSHAKING → SYNCING →
//! RUNNING. Dial failures back off exponentially (50 ms doubling, capped at
//! 30 s, reset on success). A connected session exchanges the version byte,
//! syncs the beacon filter set, then serves three event sources with no
//! particular priority: the scan-record channel, the batch flush tick, and
//! the beacon-refresh tick. Any session error drops back to DISCONNECTED.

use std::{collections::HashSet, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use waypost_proto::{
    BeaconData, BeaconLogPacket, BeaconResponsePacket, MAX_CTRL, MAX_RESPONSE_FRAME,
    RequestFlags, ResponseFlags, Uuid, framing::FramedStream, truncate_utf8,
};

use crate::{
    batch::BatchBuffer,
    error::EdgeError,
    runner::CommandRunner,
    scanner::BeaconRecord,
};

/// Backoff after the first failed dial.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Edge client configuration.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// This edge's identity.
    pub uuid: Uuid,
    /// Server host name (also the TLS server name).
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Period between beacon-list refreshes.
    pub beacon_refresh_interval: Duration,
    /// Maximum residency of samples in the batch before a flush.
    pub batch_flush_interval: Duration,
}

/// The edge client: connection lifecycle plus the RUNNING loop.
pub struct EdgeClient {
    config: EdgeConfig,
    active: HashSet<BeaconData>,
    rx: mpsc::Receiver<BeaconRecord>,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    backoff: Duration,
}

impl EdgeClient {
    /// Create a client consuming scan records from `rx`.
    #[must_use]
    pub fn new(
        config: EdgeConfig,
        rx: mpsc::Receiver<BeaconRecord>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            active: HashSet::new(),
            rx,
            runner,
            cancel,
            backoff: INITIAL_BACKOFF,
        }
    }

    /// Dial-and-serve until cancelled.
    ///
    /// Only cancellation and a closed scanner channel end this loop; every
    /// other failure reconnects with backoff.
    pub async fn run(mut self, tls: TlsConnector) -> Result<(), EdgeError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.dial(&tls).await {
                Ok(stream) => {
                    self.backoff = INITIAL_BACKOFF;
                    match self.run_session(stream).await {
                        Ok(()) => return Ok(()),
                        Err(err @ EdgeError::ScannerClosed) => return Err(err),
                        Err(err) => {
                            tracing::warn!(error = %err, "session ended, reconnecting");
                        },
                    }
                },
                Err(err) => tracing::warn!(error = %err, "dial failed"),
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.backoff) => {},
            }
            self.backoff = next_backoff(self.backoff);
        }
    }

    async fn dial(
        &self,
        tls: &TlsConnector,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, EdgeError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tracing::debug!(%addr, "dialing");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| EdgeError::Dial(format!("{addr}: {e}")))?;
        let name = ServerName::try_from(self.config.host.clone())
            .map_err(|e| EdgeError::Config(format!("bad server name: {e}")))?;
        tls.connect(name, tcp)
            .await
            .map_err(|e| EdgeError::Dial(format!("TLS with {addr}: {e}")))
    }

    /// Serve one connected session until it errors or cancellation fires.
    ///
    /// Public for tests, which drive it over an in-memory stream.
    pub async fn run_session<S>(&mut self, stream: S) -> Result<(), EdgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = FramedStream::new(stream, self.cancel.clone());
        framed.handshake().await?;
        self.refresh_beacons(&mut framed).await?;

        let mut batch = BatchBuffer::new(self.config.uuid);
        let mut flush_tick = tokio::time::interval(self.config.batch_flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh_tick = tokio::time::interval(self.config.beacon_refresh_interval);
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately once; the sync above covered that
        flush_tick.tick().await;
        refresh_tick.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),

                record = self.rx.recv() => {
                    let record = record.ok_or(EdgeError::ScannerClosed)?;
                    if !self.active.contains(&record.data) {
                        continue;
                    }
                    batch.push(&record);
                    if batch.is_full() {
                        tracing::debug!("batch hit a protocol cap, flushing early");
                        self.flush(&mut framed, &mut batch).await?;
                    }
                },

                _ = flush_tick.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut framed, &mut batch).await?;
                    }
                },

                _ = refresh_tick.tick() => {
                    self.refresh_beacons(&mut framed).await?;
                },
            }
        }
    }

    /// Send the batch and process the response.
    async fn flush<S>(
        &mut self,
        framed: &mut FramedStream<S>,
        batch: &mut BatchBuffer,
    ) -> Result<(), EdgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = batch.take();
        tracing::debug!(
            beacons = packet.beacons.len(),
            logs = packet.logs.len(),
            "flushing batch"
        );
        let response = self.round_trip(framed, &packet).await?;
        if response.flags.contains(ResponseFlags::SYSTEM) {
            self.execute_control(framed, &response.data).await?;
        }
        Ok(())
    }

    /// Re-request the authoritative beacon list and swap the filter set.
    async fn refresh_beacons<S>(
        &mut self,
        framed: &mut FramedStream<S>,
    ) -> Result<(), EdgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = BeaconLogPacket::new(self.config.uuid);
        request.flags = RequestFlags::with(RequestFlags::BEACON_UPDATES);
        let response = self.round_trip(framed, &request).await?;
        if !response.flags.contains(ResponseFlags::BEACON_UPDATES) {
            return Err(EdgeError::UnexpectedResponse(
                "beacon refresh response without a beacon list".to_string(),
            ));
        }
        self.active = response
            .data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<HashSet<BeaconData>, _>>()?;
        tracing::info!(count = self.active.len(), "active beacon filter updated");
        Ok(())
    }

    /// Execute a dispatched command and uplink its completion.
    async fn execute_control<S>(
        &mut self,
        framed: &mut FramedStream<S>,
        data: &str,
    ) -> Result<(), EdgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (control_id, argv) = parse_control(data)?;
        tracing::info!(control_id, command = ?argv, "executing dispatched command");

        let combined = match self.runner.run(&argv).await {
            Ok(output) => output.combined,
            // The server still needs a completion, or it will re-deliver
            // the same command forever
            Err(err) => format!("execution failed: {err}\n"),
        };

        let mut complete = BeaconLogPacket::new(self.config.uuid);
        complete.flags = RequestFlags::with(RequestFlags::CONTROL_COMPLETE);
        let payload = format!("{control_id}\n{combined}");
        complete.control_data = truncate_utf8(&payload, MAX_CTRL).to_string();
        self.round_trip(framed, &complete).await?;
        Ok(())
    }

    /// One request/response exchange; terminal response flags are errors.
    async fn round_trip<S>(
        &mut self,
        framed: &mut FramedStream<S>,
        packet: &BeaconLogPacket,
    ) -> Result<BeaconResponsePacket, EdgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        framed.write_record(&packet.encode()?).await?;
        let raw = framed.read_record(MAX_RESPONSE_FRAME).await?;
        let response = BeaconResponsePacket::decode(&raw)?;
        if response.flags.is_terminal() {
            return Err(EdgeError::ServerRejected(response.flags.0));
        }
        Ok(response)
    }
}

/// Double toward the ceiling.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Parse a dispatched control payload: `"<controlId>\n<JSON argv>"`.
fn parse_control(data: &str) -> Result<(i64, Vec<String>), EdgeError> {
    let (id_text, json) = data
        .split_once('\n')
        .ok_or_else(|| EdgeError::ControlPayload("missing id separator".to_string()))?;
    let control_id: i64 = id_text
        .trim()
        .parse()
        .map_err(|_| EdgeError::ControlPayload(format!("bad control id {id_text:?}")))?;
    let argv: Vec<String> = serde_json::from_str(json)
        .map_err(|e| EdgeError::ControlPayload(format!("bad argv: {e}")))?;
    if argv.is_empty() {
        return Err(EdgeError::ControlPayload("empty argv".to_string()));
    }
    Ok((control_id, argv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_ceiling() {
        let mut backoff = INITIAL_BACKOFF;
        let mut steps = Vec::new();
        for _ in 0..12 {
            steps.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(steps[0], Duration::from_millis(50));
        assert_eq!(steps[1], Duration::from_millis(100));
        assert_eq!(steps[2], Duration::from_millis(200));
        assert_eq!(backoff, MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn parses_a_control_payload() {
        let (id, argv) = parse_control("42\n[\"echo\",\"hi\"]").unwrap();
        assert_eq!(id, 42);
        assert_eq!(argv, vec!["echo".to_string(), "hi".to_string()]);
    }

    #[test]
    fn rejects_malformed_control_payloads() {
        assert!(matches!(
            parse_control("no separator"),
            Err(EdgeError::ControlPayload(_))
        ));
        assert!(matches!(
            parse_control("abc\n[\"echo\"]"),
            Err(EdgeError::ControlPayload(_))
        ));
        assert!(matches!(
            parse_control("1\nnot json"),
            Err(EdgeError::ControlPayload(_))
        ));
        assert!(matches!(parse_control("1\n[]"), Err(EdgeError::ControlPayload(_))));
    }
}
