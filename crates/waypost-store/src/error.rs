//! Store error type.

use thiserror::Error;
use waypost_proto::Uuid;

/// Errors from store operations.
///
/// The ingest layer distinguishes lookup misses (which indicate a bad
/// request and map to an INVALID response) from backend failures (which map
/// to INTERNAL_FAILURE).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Edge UUID is not registered.
    #[error("unknown edge {0}")]
    UnknownEdge(Uuid),

    /// iBeacon triple is not registered.
    #[error("unknown beacon {uuid},{major},{minor}")]
    UnknownBeacon {
        /// Advertised UUID
        uuid: Uuid,
        /// Advertised major
        major: u16,
        /// Advertised minor
        minor: u16,
    },

    /// Map id is not registered.
    #[error("unknown map {0}")]
    UnknownMap(i64),

    /// No store driver with this name is linked in.
    #[error("unknown store driver {0:?}")]
    UnknownDriver(String),

    /// Backend failure (connection, query, serialization).
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the error names an unregistered entity rather than a
    /// backend failure.
    #[must_use]
    pub fn is_unknown_entity(&self) -> bool {
        matches!(
            self,
            Self::UnknownEdge(_) | Self::UnknownBeacon { .. } | Self::UnknownMap(_)
        )
    }
}
