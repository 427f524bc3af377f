//! Advertisement scanning: raw capture parsing and the radio subprocess.
//!
//! The radio side is an opaque byte source producing the classic capture
//! dump format: whitespace-separated hex octet tokens, with `>` marking the
//! start of each frame. Frames are reassembled, scanned for the vendor
//! prefix `4C 00 02`, and decoded into [`BeaconRecord`]s. Malformed frames
//! are skipped, never fatal.
//!
//! Records flow into a bounded channel; when the consumer falls behind the
//! producer blocks rather than dropping samples.

use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStdout, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use waypost_proto::BeaconData;

use crate::error::EdgeError;

/// Byte pattern opening the vendor-specific iBeacon section.
const VENDOR_PREFIX: [u8; 3] = [0x4C, 0x00, 0x02];

/// Bytes needed after the prefix: uuid, major, minor, measured power, rssi.
const IBEACON_SECTION_LEN: usize = 22;

/// Capacity of the scan-record channel.
pub const SCAN_CHANNEL_CAP: usize = 256;

/// One observed advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconRecord {
    /// Advertised iBeacon triple.
    pub data: BeaconData,
    /// Capture instant.
    pub at: DateTime<Utc>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// The radio capture subprocesses.
///
/// Holds the scan trigger and the dump process; both are killed when this
/// is dropped.
pub struct RadioCapture {
    _scan: Child,
    dump: Child,
}

impl RadioCapture {
    /// Take the dump process's stdout to feed [`run_scanner`].
    pub fn take_stdout(&mut self) -> Result<ChildStdout, EdgeError> {
        self.dump
            .stdout
            .take()
            .ok_or_else(|| EdgeError::Config("hcidump stdout not captured".to_string()))
    }
}

/// Start the radio capture subprocesses.
pub fn spawn_radio() -> Result<RadioCapture, EdgeError> {
    let scan = Command::new("hcitool")
        .args(["lescan", "--duplicates"])
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EdgeError::Config(format!("starting hcitool: {e}")))?;

    let dump = Command::new("hcidump")
        .arg("--raw")
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EdgeError::Config(format!("starting hcidump: {e}")))?;

    Ok(RadioCapture { _scan: scan, dump })
}

/// Parse the capture stream and push records into the channel until the
/// source ends or the token fires.
pub async fn run_scanner<R>(
    mut source: R,
    tx: mpsc::Sender<BeaconRecord>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut pending_token = Vec::new();
    let mut frame = Vec::new();
    let mut in_frame = false;

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = source.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, "capture stream read failed");
                break;
            },
        };

        for &byte in &chunk[..n] {
            if byte.is_ascii_whitespace() {
                if !pending_token.is_empty() {
                    let token = std::mem::take(&mut pending_token);
                    consume_token(&token, &mut frame, &mut in_frame, &tx, &cancel).await;
                }
            } else {
                pending_token.push(byte);
            }
        }
    }

    // Flush the trailing token and frame at end of stream
    if !pending_token.is_empty() {
        consume_token(&pending_token.clone(), &mut frame, &mut in_frame, &tx, &cancel).await;
    }
    if in_frame {
        emit_frame(&frame, &tx).await;
    }
    tracing::info!("capture stream ended");
}

async fn consume_token(
    token: &[u8],
    frame: &mut Vec<u8>,
    in_frame: &mut bool,
    tx: &mpsc::Sender<BeaconRecord>,
    cancel: &CancellationToken,
) {
    if token == b">" {
        if *in_frame && !frame.is_empty() && !cancel.is_cancelled() {
            emit_frame(frame, tx).await;
        }
        frame.clear();
        *in_frame = true;
        return;
    }
    if !*in_frame {
        // Header noise before the first frame marker
        return;
    }
    match std::str::from_utf8(token)
        .ok()
        .filter(|t| t.len() == 2)
        .and_then(|t| u8::from_str_radix(t, 16).ok())
    {
        Some(octet) => frame.push(octet),
        None => {
            tracing::debug!(?token, "skipping non-octet capture token");
        },
    }
}

async fn emit_frame(frame: &[u8], tx: &mpsc::Sender<BeaconRecord>) {
    let Some((data, rssi)) = parse_advertisement(frame) else {
        return;
    };
    let record = BeaconRecord { data, at: Utc::now(), rssi };
    if tx.send(record).await.is_err() {
        tracing::debug!("scan channel closed, dropping record");
    }
}

/// Extract the iBeacon triple and RSSI from one advertisement frame.
///
/// Returns `None` for frames without the vendor section or with too few
/// bytes after it.
#[must_use]
pub fn parse_advertisement(frame: &[u8]) -> Option<(BeaconData, i16)> {
    let start = frame
        .windows(VENDOR_PREFIX.len())
        .position(|window| window == VENDOR_PREFIX)?;
    // One length byte sits between the prefix and the payload
    let section = frame.get(start + 4..)?;
    if section.len() < IBEACON_SECTION_LEN {
        tracing::debug!(len = section.len(), "vendor section too short");
        return None;
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&section[..16]);
    let major = u16::from_be_bytes([section[16], section[17]]);
    let minor = u16::from_be_bytes([section[18], section[19]]);
    // section[20] is the advertised measured power; the capture appends the
    // actual RSSI after it
    let rssi = i16::from(section[21] as i8);

    Some((BeaconData { uuid: waypost_proto::Uuid::from_bytes(uuid), major, minor }, rssi))
}
