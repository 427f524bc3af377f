//! Flag fields for request and response packets.
//!
//! The low nibble of each flag field carries the protocol version; the
//! remaining bits select behavior. Requests have only the high nibble of a
//! `u8` to work with, responses a full `u16`.

use crate::{CURRENT_VERSION, VERSION_MASK, error::ProtocolError};

/// Request flag bits (client → server), carried in a `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFlags(pub u8);

impl RequestFlags {
    /// Ask for the authoritative beacon list.
    pub const BEACON_UPDATES: u8 = 0x10;
    /// Carry a free-form control log line.
    pub const CONTROL_LOG: u8 = 0x20;
    /// Carry the completion payload of a dispatched command.
    pub const CONTROL_COMPLETE: u8 = 0x40;

    /// All bits with defined meaning (beyond the version nibble).
    const KNOWN: u8 = Self::BEACON_UPDATES | Self::CONTROL_LOG | Self::CONTROL_COMPLETE;

    /// Flags for a plain sample batch at the current version.
    #[must_use]
    pub fn sample_batch() -> Self {
        Self(CURRENT_VERSION)
    }

    /// Flags with a single request bit set at the current version.
    #[must_use]
    pub fn with(bit: u8) -> Self {
        Self(CURRENT_VERSION | bit)
    }

    /// The version nibble.
    #[must_use]
    pub fn version(self) -> u8 {
        self.0 & (VERSION_MASK as u8)
    }
}

/// Response flag bits (server → client), carried in a `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFlags(pub u16);

impl ResponseFlags {
    /// Request was malformed or referenced unknown entities.
    pub const INVALID: u16 = 0x10;
    /// Request processed.
    pub const OK: u16 = 0x20;
    /// Server-side capacity refused the request.
    pub const TOOMANY: u16 = 0x40;
    /// Edge should restart its service.
    pub const RESTART: u16 = 0x80;
    /// Edge should shut down.
    pub const SHUTDOWN: u16 = 0x100;
    /// Edge should self-update.
    pub const UPDATE: u16 = 0x200;
    /// Data section holds the newline-joined beacon list.
    pub const BEACON_UPDATES: u16 = 0x400;
    /// Server-side failure unrelated to the request contents.
    pub const INTERNAL_FAILURE: u16 = 0x800;
    /// Data section holds a dispatched shell command.
    pub const SYSTEM: u16 = 0x8000;

    /// Flags with the given bits set at the current version.
    #[must_use]
    pub fn with(bits: u16) -> Self {
        Self(u16::from(CURRENT_VERSION) | bits)
    }

    /// The version nibble.
    #[must_use]
    pub fn version(self) -> u8 {
        (self.0 & VERSION_MASK) as u8
    }

    /// True when any of `bits` is set.
    #[must_use]
    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    /// Set additional bits.
    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    /// True for the flag values after which the server closes the connection.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.contains(Self::INVALID | Self::INTERNAL_FAILURE)
    }
}

/// The request variant a packet's flag byte selects.
///
/// The flag bitset admits overlapping combinations; this enum is produced by
/// a single inspection that rejects them outright, so downstream dispatch
/// never has to define a precedence between bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// No request bit set: the packet is a sample batch.
    SampleBatch,
    /// Beacon-list refresh request.
    BeaconUpdates,
    /// Free-form control log line.
    ControlLog,
    /// Completion payload for a dispatched command.
    ControlComplete,
}

impl RequestKind {
    /// Classify a request flag byte.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidFlags`] when more than one request bit is set
    /// or an undefined bit is present.
    pub fn from_flags(flags: u8) -> Result<Self, ProtocolError> {
        let request_bits = flags & !(VERSION_MASK as u8);
        if request_bits & !RequestFlags::KNOWN != 0 {
            return Err(ProtocolError::InvalidFlags(flags));
        }
        match request_bits {
            0 => Ok(Self::SampleBatch),
            RequestFlags::BEACON_UPDATES => Ok(Self::BeaconUpdates),
            RequestFlags::CONTROL_LOG => Ok(Self::ControlLog),
            RequestFlags::CONTROL_COMPLETE => Ok(Self::ControlComplete),
            _ => Err(ProtocolError::InvalidFlags(flags)),
        }
    }
}
