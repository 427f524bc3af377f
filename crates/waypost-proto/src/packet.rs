//! Packet types and their bit-exact little-endian codec.
//!
//! Layouts (all integers little-endian, no padding):
//!
//! - `BeaconLog` (12 bytes): `t_micros: i64 | rssi: i16 | beacon_index: u16`
//! - `BeaconData` (20 bytes): `uuid: 16 | major: u16 | minor: u16`
//! - `BeaconLogPacket`: `flags: u8 | uuid: 16 | n_beacons: u16 | n_logs: u16 |
//!   n_control: u16 | beacons | logs | control_data`
//! - `BeaconResponsePacket`: `flags: u16 | data_len: u32 | data`
//!
//! Decoding is exact: a buffer longer or shorter than the declared layout is
//! rejected, as are counts above the protocol caps.

use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};

use crate::{
    BEACON_DATA_LEN, BEACON_LOG_LEN, CURRENT_VERSION, MAX_BEACONS, MAX_CTRL, MAX_LOGS,
    PACKET_HEADER_LEN, RESPONSE_HEADER_LEN,
    error::ProtocolError,
    flags::{RequestFlags, ResponseFlags},
    uuid::Uuid,
};

/// One observed signal-strength sample.
///
/// `at` is stored with microsecond precision on the wire; sub-microsecond
/// components do not round-trip and must not be relied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconLog {
    /// Sample instant.
    pub at: DateTime<Utc>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Offset into the enclosing packet's beacon table (I2).
    pub beacon_index: u16,
}

impl BeaconLog {
    fn encode(&self, dst: &mut impl BufMut) {
        dst.put_i64_le(self.at.timestamp_micros());
        dst.put_i16_le(self.rssi);
        dst.put_u16_le(self.beacon_index);
    }

    fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        debug_assert_eq!(src.len(), BEACON_LOG_LEN);
        let micros = src.get_i64_le();
        let at = DateTime::from_timestamp_micros(micros)
            .ok_or(ProtocolError::InvalidTimestamp(micros))?;
        Ok(Self { at, rssi: src.get_i16_le(), beacon_index: src.get_u16_le() })
    }
}

/// The over-the-air identity of a beacon: its iBeacon triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BeaconData {
    /// Advertised 16-byte UUID.
    pub uuid: Uuid,
    /// Advertised major number.
    pub major: u16,
    /// Advertised minor number.
    pub minor: u16,
}

impl BeaconData {
    fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.uuid.as_bytes());
        dst.put_u16_le(self.major);
        dst.put_u16_le(self.minor);
    }

    fn decode(src: &[u8]) -> Self {
        debug_assert_eq!(src.len(), BEACON_DATA_LEN);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&src[..16]);
        let mut rest = &src[16..];
        Self { uuid: Uuid::from_bytes(uuid), major: rest.get_u16_le(), minor: rest.get_u16_le() }
    }
}

impl fmt::Display for BeaconData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.uuid, self.major, self.minor)
    }
}

impl FromStr for BeaconData {
    type Err = ProtocolError;

    /// Parse the canonical `uuid,major,minor` triple.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedUuid(s.to_string());
        let mut parts = s.trim().split(',');
        let uuid: Uuid = parts.next().ok_or_else(malformed)?.parse()?;
        let major = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let minor = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self { uuid, major, minor })
    }
}

/// Uplink packet: a sample batch or one of the flagged request variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconLogPacket {
    /// Version nibble plus at most one request bit.
    pub flags: RequestFlags,
    /// Sender edge identity.
    pub uuid: Uuid,
    /// Beacon table the logs index into.
    pub beacons: Vec<BeaconData>,
    /// Observed samples, in capture order.
    pub logs: Vec<BeaconLog>,
    /// Free-form control payload (UTF-8).
    pub control_data: String,
}

impl BeaconLogPacket {
    /// An empty packet from `uuid` with only the version nibble set.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            flags: RequestFlags::sample_batch(),
            uuid,
            beacons: Vec::new(),
            logs: Vec::new(),
            control_data: String::new(),
        }
    }

    /// Encoded size of this packet.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN
            + BEACON_DATA_LEN * self.beacons.len()
            + BEACON_LOG_LEN * self.logs.len()
            + self.control_data.len()
    }

    /// Encode to the wire layout.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::OverCap`] when a section exceeds its protocol cap;
    /// the caps are enforced symmetrically on decode.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        check_caps(self.beacons.len(), self.logs.len(), self.control_data.len())?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.put_u8(self.flags.0);
        out.put_slice(self.uuid.as_bytes());
        out.put_u16_le(self.beacons.len() as u16);
        out.put_u16_le(self.logs.len() as u16);
        out.put_u16_le(self.control_data.len() as u16);
        for beacon in &self.beacons {
            beacon.encode(&mut out);
        }
        for log in &self.logs {
            log.encode(&mut out);
        }
        out.put_slice(self.control_data.as_bytes());
        Ok(out)
    }

    /// Decode from the wire layout.
    ///
    /// # Errors
    ///
    /// Structural errors per the module rules: short header, counts over cap,
    /// version newer than [`CURRENT_VERSION`], and any mismatch between the
    /// declared layout and the actual byte length.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: PACKET_HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut src = data;
        let flags = RequestFlags(src.get_u8());
        if flags.version() > CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(flags.version()));
        }

        let mut uuid = [0u8; 16];
        src.copy_to_slice(&mut uuid);
        let n_beacons = src.get_u16_le() as usize;
        let n_logs = src.get_u16_le() as usize;
        let n_control = src.get_u16_le() as usize;
        check_caps(n_beacons, n_logs, n_control)?;

        let required = PACKET_HEADER_LEN
            + BEACON_DATA_LEN * n_beacons
            + BEACON_LOG_LEN * n_logs
            + n_control;
        if data.len() != required {
            return Err(ProtocolError::LengthMismatch { expected: required, actual: data.len() });
        }

        let mut beacons = Vec::with_capacity(n_beacons);
        for _ in 0..n_beacons {
            beacons.push(BeaconData::decode(&src[..BEACON_DATA_LEN]));
            src.advance(BEACON_DATA_LEN);
        }
        let mut logs = Vec::with_capacity(n_logs);
        for _ in 0..n_logs {
            logs.push(BeaconLog::decode(&src[..BEACON_LOG_LEN])?);
            src.advance(BEACON_LOG_LEN);
        }
        let control_data = std::str::from_utf8(src)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();

        Ok(Self { flags, uuid: Uuid::from_bytes(uuid), beacons, logs, control_data })
    }
}

/// Downlink packet: response flags plus a free-form data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconResponsePacket {
    /// Version nibble plus response bits.
    pub flags: ResponseFlags,
    /// Beacon list, dispatched command, or empty.
    pub data: String,
}

impl BeaconResponsePacket {
    /// A response with the given bits set and no data.
    #[must_use]
    pub fn new(bits: u16) -> Self {
        Self { flags: ResponseFlags::with(bits), data: String::new() }
    }

    /// Encode to the wire layout.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::OverCap`] when `data` exceeds the framed response
    /// limit.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let cap = crate::MAX_RESPONSE_FRAME - RESPONSE_HEADER_LEN;
        if self.data.len() > cap {
            return Err(ProtocolError::OverCap { field: "data", got: self.data.len(), cap });
        }
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + self.data.len());
        out.put_u16_le(self.flags.0);
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(self.data.as_bytes());
        Ok(out)
    }

    /// Decode from the wire layout.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: RESPONSE_HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut src = data;
        let flags = ResponseFlags(src.get_u16_le());
        if flags.version() > CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(flags.version()));
        }
        let declared = src.get_u32_le() as usize;
        if src.len() != declared {
            return Err(ProtocolError::LengthMismatch {
                expected: RESPONSE_HEADER_LEN + declared,
                actual: data.len(),
            });
        }
        let text = std::str::from_utf8(src).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Self { flags, data: text.to_string() })
    }
}

fn check_caps(beacons: usize, logs: usize, control: usize) -> Result<(), ProtocolError> {
    if beacons > MAX_BEACONS {
        return Err(ProtocolError::OverCap { field: "beacons", got: beacons, cap: MAX_BEACONS });
    }
    if logs > MAX_LOGS {
        return Err(ProtocolError::OverCap { field: "logs", got: logs, cap: MAX_LOGS });
    }
    if control > MAX_CTRL {
        return Err(ProtocolError::OverCap { field: "control", got: control, cap: MAX_CTRL });
    }
    Ok(())
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
///
/// Used for control-command output, which is capped at [`MAX_CTRL`] bytes on
/// the wire.
#[must_use]
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
