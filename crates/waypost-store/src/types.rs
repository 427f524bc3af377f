//! Row types exchanged with the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One signal-strength sample ready for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Sample instant, UTC.
    pub at: DateTime<Utc>,
    /// Surrogate id of the observed beacon.
    pub beacon_id: i64,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// A control command awaiting delivery to its edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingControl {
    /// Command id, unique per store.
    pub id: i64,
    /// Command text (a JSON argv array).
    pub text: String,
}

/// Classification of a ledger entry; the collapse key is `(edge, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Edge clock disagrees with the server clock.
    Desync,
    /// Packet referenced an unregistered edge.
    UnknownEdge,
    /// Packet referenced an unregistered beacon.
    UnknownBeacon,
}

impl ErrorKind {
    /// Stable text name used in notifications.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desync => "DESYNC",
            Self::UnknownEdge => "UNKNOWN_EDGE",
            Self::UnknownBeacon => "UNKNOWN_BEACON",
        }
    }
}

/// Severity of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    /// Condition was tolerated.
    Warn,
    /// Condition caused a request to be rejected.
    Error,
}

impl ErrorLevel {
    /// Stable text name used in notifications.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// A new error observation, before collapsing.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Classification.
    pub kind: ErrorKind,
    /// Severity.
    pub level: ErrorLevel,
    /// Human-readable detail.
    pub text: String,
    /// Edge the error concerns, when attributable.
    pub edge_id: Option<i64>,
}

/// A stored ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Assigned id, monotonically increasing.
    pub id: i64,
    /// Insertion instant.
    pub at: DateTime<Utc>,
    /// Classification.
    pub kind: ErrorKind,
    /// Severity.
    pub level: ErrorLevel,
    /// Human-readable detail.
    pub text: String,
    /// Edge the error concerns, when attributable.
    pub edge_id: Option<i64>,
    /// How many matching observations collapsed into this entry.
    pub count: u32,
}

/// One averaged `(beacon, edge)` observation with its distance estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RssiObservation {
    /// Beacon surrogate id.
    pub beacon: i64,
    /// Edge surrogate id.
    pub edge: i64,
    /// Bracketed mean RSSI.
    pub rssi: f64,
    /// Path-loss distance estimate in metres.
    pub dist: f64,
}

/// Display configuration of one tracked map.
///
/// Stored as a JSON document; `limits` is `[x_min, x_max, y_min, y_max]`
/// and bounds the clamped filter particles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Map id.
    #[serde(default)]
    pub id: i64,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// X offset applied when drawing over the background image.
    pub coord_bias_x: i32,
    /// Y offset applied when drawing over the background image.
    pub coord_bias_y: i32,
    /// X scale; may be negative to flip the coordinate system.
    pub coord_scale_x: f64,
    /// Y scale; may be negative to flip the coordinate system.
    pub coord_scale_y: f64,
    /// `[x_min, x_max, y_min, y_max]` in metres.
    pub limits: [f64; 4],
    /// Edges whose anchors cover this map.
    pub edges: Vec<i64>,
}
