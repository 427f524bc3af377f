//! Fusion error type.

use thiserror::Error;
use waypost_store::StoreError;

use crate::trilat::TrilatError;

/// Errors from the location-fusion pipeline.
///
/// [`FusionError::is_bad_request`] separates caller mistakes (unknown map,
/// unknown algorithm) from server-side failures, mirroring the 400/500 split
/// of the analytics surface that consumes this crate.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Algorithm name is not in the closed set.
    #[error("unknown fusion algorithm {0:?}")]
    UnknownAlgorithm(String),

    /// Request named no beacons.
    #[error("request must name at least one beacon")]
    NoBeacons,

    /// A beacon had too few anchored observations to trilaterate.
    #[error("beacon {beacon} has {got} anchored observations, need at least 3")]
    TooFewObservations {
        /// Beacon surrogate id
        beacon: i64,
        /// Observations available
        got: usize,
    },

    /// The trilateration solver failed for a beacon.
    #[error("trilateration failed for beacon {beacon}: {source}")]
    Trilateration {
        /// Beacon surrogate id
        beacon: i64,
        /// Solver failure
        source: TrilatError,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FusionError {
    /// True when the request itself was at fault.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        match self {
            Self::UnknownAlgorithm(_) | Self::NoBeacons => true,
            Self::Store(err) => err.is_unknown_entity(),
            Self::TooFewObservations { .. } | Self::Trilateration { .. } => false,
        }
    }
}
