//! Per-connection ingest state machine.
//!
//! After the transport's mutual-TLS handshake and the one-byte version
//! exchange, a connection is a strict request/response loop: one framed
//! [`BeaconLogPacket`] in, one framed [`BeaconResponsePacket`] out, in
//! order. The connection is torn down after any INVALID or
//! INTERNAL_FAILURE response, on transport error, and on cancellation.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use waypost_proto::{
    BeaconLogPacket, BeaconResponsePacket, FrameError, MAX_REQUEST_FRAME, RequestKind,
    ResponseFlags, framing::FramedStream,
};
use waypost_store::{ErrorKind, ErrorLevel, Sample, Store, StoreError};

use crate::{control::ControlDispatcher, error::ServerError, ledger::ErrorLedger};

/// Clock skew beyond which a sample batch is rejected.
const SKEW_REJECT_MS: i64 = 30_000;

/// Clock skew beyond which an accepted batch still records a warning.
const SKEW_WARN_MS: i64 = 5_000;

/// Shared ingest context, one instance per server.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    dispatcher: ControlDispatcher,
    ledger: ErrorLedger,
}

impl Ingestor {
    /// Create an ingestor over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            dispatcher: ControlDispatcher::new(Arc::clone(&store)),
            ledger: ErrorLedger::new(Arc::clone(&store)),
            store,
        }
    }

    /// Drive one authenticated connection to completion.
    ///
    /// Returns `Ok(())` for orderly teardown (peer closed, terminal
    /// response sent, cancellation); transport failures propagate.
    pub async fn serve_connection<T>(
        &self,
        stream: T,
        cancel: CancellationToken,
    ) -> Result<(), ServerError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = FramedStream::new(stream, cancel.clone());

        match framed.handshake().await {
            Ok(peer_version) => tracing::debug!(peer_version, "version handshake complete"),
            Err(FrameError::VersionMismatch { peer, supported }) => {
                tracing::warn!(peer, supported, "rejecting peer with newer protocol version");
                return Ok(());
            },
            Err(err) => return Err(err.into()),
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let payload = match framed.read_record(MAX_REQUEST_FRAME).await {
                Ok(payload) => payload,
                Err(FrameError::PeerClosed) => return Ok(()),
                Err(FrameError::Cancelled) => {
                    // Best-effort; the cancelled write path sends nothing
                    // rather than a partial frame
                    self.write_response(
                        &mut framed,
                        BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE),
                    )
                    .await;
                    return Ok(());
                },
                Err(err @ FrameError::DeadlineExhausted(_)) => {
                    tracing::debug!(error = %err, "peer idle past deadline");
                    self.write_response(
                        &mut framed,
                        BeaconResponsePacket::new(ResponseFlags::INVALID),
                    )
                    .await;
                    return Ok(());
                },
                Err(err @ FrameError::RecordTooLarge { .. }) => {
                    tracing::warn!(error = %err, "oversize record");
                    self.write_response(
                        &mut framed,
                        BeaconResponsePacket::new(ResponseFlags::INVALID),
                    )
                    .await;
                    return Ok(());
                },
                Err(err) => return Err(err.into()),
            };

            let response = match BeaconLogPacket::decode(&payload) {
                Ok(packet) => self.handle_packet(&packet).await,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed packet");
                    BeaconResponsePacket::new(ResponseFlags::INVALID)
                },
            };

            let terminal = response.flags.is_terminal();
            self.write_response(&mut framed, response).await;
            if terminal {
                return Ok(());
            }
        }
    }

    /// Best-effort response write; the connection is closing anyway when
    /// this fails.
    async fn write_response<T>(
        &self,
        framed: &mut FramedStream<T>,
        response: BeaconResponsePacket,
    ) where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode response");
                return;
            },
        };
        if let Err(err) = framed.write_record(&encoded).await {
            tracing::debug!(error = %err, "failed to write response");
        }
    }

    /// Dispatch one decoded packet to a response.
    async fn handle_packet(&self, packet: &BeaconLogPacket) -> BeaconResponsePacket {
        let kind = match RequestKind::from_flags(packet.flags.0) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::warn!(error = %err, "bad request flags");
                return BeaconResponsePacket::new(ResponseFlags::INVALID);
            },
        };

        match kind {
            RequestKind::BeaconUpdates => self.beacon_updates().await,
            RequestKind::ControlLog => self.control_log(packet).await,
            RequestKind::ControlComplete => self.control_complete(packet).await,
            RequestKind::SampleBatch => self.sample_batch(packet).await,
        }
    }

    async fn beacon_updates(&self) -> BeaconResponsePacket {
        match self.store.list_beacons().await {
            Ok(beacons) => {
                let data = beacons
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                BeaconResponsePacket {
                    flags: ResponseFlags::with(
                        ResponseFlags::OK | ResponseFlags::BEACON_UPDATES,
                    ),
                    data,
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to list beacons");
                BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE)
            },
        }
    }

    async fn control_log(&self, packet: &BeaconLogPacket) -> BeaconResponsePacket {
        let edge_id = match self.resolve_edge(packet).await {
            Ok(edge_id) => edge_id,
            Err(response) => return response,
        };
        match self.store.insert_control_log(edge_id, &packet.control_data).await {
            Ok(()) => BeaconResponsePacket::new(ResponseFlags::OK),
            Err(err) => {
                tracing::error!(error = %err, "failed to insert control log");
                BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE)
            },
        }
    }

    async fn control_complete(&self, packet: &BeaconLogPacket) -> BeaconResponsePacket {
        let edge_id = match self.resolve_edge(packet).await {
            Ok(edge_id) => edge_id,
            Err(response) => return response,
        };
        let Some((id_text, output)) = packet.control_data.split_once('\n') else {
            tracing::warn!(edge_id, "control completion without id separator");
            return BeaconResponsePacket::new(ResponseFlags::INVALID);
        };
        let Ok(control_id) = id_text.trim().parse::<i64>() else {
            tracing::warn!(edge_id, id_text, "control completion with non-numeric id");
            return BeaconResponsePacket::new(ResponseFlags::INVALID);
        };
        match self.dispatcher.complete(edge_id, control_id, output).await {
            Ok(()) => BeaconResponsePacket::new(ResponseFlags::OK),
            Err(err) => {
                tracing::error!(error = %err, "failed to complete control");
                BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE)
            },
        }
    }

    async fn sample_batch(&self, packet: &BeaconLogPacket) -> BeaconResponsePacket {
        let edge_id = match self.resolve_edge(packet).await {
            Ok(edge_id) => edge_id,
            Err(response) => return response,
        };

        // Clock-skew gate on the first sample (P6)
        if let Some(first) = packet.logs.first() {
            let skew_ms = (Utc::now() - first.at).num_milliseconds();
            if skew_ms.abs() > SKEW_REJECT_MS {
                self.ledger
                    .record_desync(ErrorLevel::Error, edge_id, skew_ms / 1000)
                    .await;
                tracing::warn!(edge_id, skew_ms, "rejecting batch beyond skew bound");
                return BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE);
            }
            if skew_ms.abs() > SKEW_WARN_MS {
                self.ledger
                    .record_desync(ErrorLevel::Warn, edge_id, skew_ms / 1000)
                    .await;
            }
        }

        // Indices must land inside the packet's own beacon table (I2)
        if packet
            .logs
            .iter()
            .any(|log| usize::from(log.beacon_index) >= packet.beacons.len())
        {
            tracing::warn!(edge_id, "log references beacon index outside the table");
            return BeaconResponsePacket::new(ResponseFlags::INVALID);
        }

        let beacon_ids = match self.store.resolve_beacon_ids(&packet.beacons).await {
            Ok(ids) => ids,
            Err(err @ StoreError::UnknownBeacon { .. }) => {
                self.ledger
                    .record_semantic(ErrorKind::UnknownBeacon, err.to_string(), Some(edge_id))
                    .await;
                return BeaconResponsePacket::new(ResponseFlags::INVALID);
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to resolve beacons");
                return BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE);
            },
        };

        let samples: Vec<Sample> = packet
            .logs
            .iter()
            .map(|log| Sample {
                at: log.at,
                beacon_id: beacon_ids[usize::from(log.beacon_index)],
                rssi: log.rssi,
            })
            .collect();

        if let Err(err) = self.store.insert_samples(edge_id, &samples).await {
            tracing::error!(error = %err, "failed to insert samples");
            return BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE);
        }
        if let Err(err) = self.store.touch_edge_last_seen(packet.uuid).await {
            tracing::error!(error = %err, "failed to touch edge last_seen");
            return BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE);
        }

        let mut response = BeaconResponsePacket::new(ResponseFlags::OK);
        if let Some((control_id, data)) = self.dispatcher.pull(edge_id).await {
            tracing::debug!(edge_id, control_id, "attaching pending control command");
            response.flags.insert(ResponseFlags::SYSTEM);
            response.data = data;
        }
        response
    }

    /// Resolve the packet's edge UUID, converting misses to responses.
    async fn resolve_edge(
        &self,
        packet: &BeaconLogPacket,
    ) -> Result<i64, BeaconResponsePacket> {
        match self.store.resolve_edge_id(packet.uuid).await {
            Ok(edge_id) => Ok(edge_id),
            Err(err @ StoreError::UnknownEdge(_)) => {
                self.ledger
                    .record_semantic(ErrorKind::UnknownEdge, err.to_string(), None)
                    .await;
                tracing::warn!(uuid = %packet.uuid, "packet from unknown edge");
                Err(BeaconResponsePacket::new(ResponseFlags::INVALID))
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to resolve edge");
                Err(BeaconResponsePacket::new(ResponseFlags::INTERNAL_FAILURE))
            },
        }
    }
}
