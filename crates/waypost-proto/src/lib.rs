//! Wire protocol for the Waypost beacon telemetry pipeline.
//!
//! Edges and the ingest server exchange three packet kinds over a
//! mutually-authenticated TLS stream:
//!
//! - [`BeaconLogPacket`] (edge → server): a batch of signal-strength samples
//!   plus the beacon table the samples index into, or one of the request
//!   variants selected by the flag byte (beacon-list refresh, control log,
//!   control completion).
//! - [`BeaconResponsePacket`] (server → edge): response flags plus a
//!   free-form data section (beacon list, dispatched control command).
//!
//! All multi-byte integers are little-endian and position-coded; there are no
//! self-describing tags. Packets travel as length-delimited records (see
//! [`framing`]) after a one-byte protocol version exchange.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod flags;
pub mod framing;
mod packet;
mod uuid;

pub use error::{FrameError, ProtocolError};
pub use flags::{RequestFlags, RequestKind, ResponseFlags};
pub use packet::{BeaconData, BeaconLog, BeaconLogPacket, BeaconResponsePacket, truncate_utf8};
pub use uuid::Uuid;

/// Default TCP port for the ingest listener.
pub const DEFAULT_PORT: u16 = 32969;

/// Protocol version carried in the low nibble of the flag field.
pub const CURRENT_VERSION: u8 = 1;

/// Mask selecting the version nibble of a flag field.
pub const VERSION_MASK: u16 = 0x0F;

/// Maximum number of beacon-table entries per packet.
pub const MAX_BEACONS: usize = 256;

/// Maximum number of log entries per packet.
pub const MAX_LOGS: usize = 256;

/// Maximum control-data length in bytes.
pub const MAX_CTRL: usize = 65535;

/// Fixed size of an encoded [`BeaconLog`].
pub const BEACON_LOG_LEN: usize = 12;

/// Fixed size of an encoded [`BeaconData`].
pub const BEACON_DATA_LEN: usize = 20;

/// Fixed header size of a [`BeaconLogPacket`] (flags, uuid, three counts).
pub const PACKET_HEADER_LEN: usize = 23;

/// Fixed header size of a [`BeaconResponsePacket`] (flags, data length).
pub const RESPONSE_HEADER_LEN: usize = 6;

/// Upper bound on an encoded request packet, from the layout caps.
pub const MAX_REQUEST_FRAME: usize =
    PACKET_HEADER_LEN + BEACON_DATA_LEN * MAX_BEACONS + BEACON_LOG_LEN * MAX_LOGS + MAX_CTRL;

/// Upper bound accepted for a framed response record.
pub const MAX_RESPONSE_FRAME: usize = 1 << 20;
