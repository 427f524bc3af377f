//! Location fusion for the Waypost beacon pipeline.
//!
//! Turns stored signal-strength samples into smoothed 2-D location
//! estimates, one per tracked beacon:
//!
//! 1. **Fetch**: map configuration, 3-D edge anchors, and time-bracketed
//!    mean RSSI with path-loss distances from the [`Store`].
//! 2. **Trilaterate**: each beacon's `(anchor, distance)` pairs yield a
//!    3-D point; the 2-D projection feeds the filter.
//! 3. **Smooth**: a per-session clamped particle filter per beacon turns
//!    successive trilateration results into a stable track.
//!
//! Sessions are identified by opaque tokens and expire after 30 seconds of
//! disuse; see [`sessions`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod filter;
pub mod sessions;
pub mod trilat;

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
pub use error::FusionError;
pub use filter::{ClampedParticleFilter, FilterParams, Limits};
pub use sessions::SessionTable;
use waypost_store::{MapConfig, Store};

/// The only algorithm in the closed set.
pub const ALGORITHM_PARTICLE_FILTER_VELOCITY: &str = "particle-filter-velocity";

/// A location request from the analytics surface.
#[derive(Debug, Clone)]
pub struct LocationRequest {
    /// Previously assigned session token, if the caller has one.
    pub session_id: Option<String>,
    /// Beacon surrogate ids to locate.
    pub beacons: Vec<i64>,
    /// Edge surrogate ids whose observations to fuse.
    pub edges: Vec<i64>,
    /// Map whose configuration bounds the estimate.
    pub map_id: i64,
    /// Instant the estimate should reflect.
    pub request_time: DateTime<Utc>,
    /// Fusion algorithm name; closed set.
    pub algorithm: String,
}

/// One smoothed location estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    /// Beacon surrogate id.
    pub beacon: i64,
    /// Instant of the estimate.
    pub time: DateTime<Utc>,
    /// Smoothed 2-D location.
    pub location: [f64; 2],
}

/// Fusion response.
#[derive(Debug, Clone)]
pub struct TrackingData {
    /// Session token; fresh when the request carried none or a dead one.
    pub session_id: String,
    /// Echo of the request instant.
    pub request_time: DateTime<Utc>,
    /// Echo of the requested beacons.
    pub beacons: Vec<i64>,
    /// Echo of the requested edges.
    pub edges: Vec<i64>,
    /// One point per beacon that could be located.
    pub series: Vec<TimeSeriesPoint>,
    /// Configuration of the requested map.
    pub map_config: MapConfig,
}

/// The fusion pipeline with its session table.
///
/// Reads the store without locking; estimates are eventually consistent
/// with ongoing ingest.
pub struct FusionService<S> {
    store: Arc<S>,
    sessions: SessionTable,
}

impl<S: Store> FusionService<S> {
    /// Create a service with the default filter parameters.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self::with_params(store, FilterParams::default())
    }

    /// Create a service with explicit filter parameters.
    #[must_use]
    pub fn with_params(store: Arc<S>, params: FilterParams) -> Self {
        Self { store, sessions: SessionTable::new(params) }
    }

    /// Produce a smoothed location estimate per requested beacon.
    ///
    /// # Errors
    ///
    /// Bad requests (unknown algorithm, unknown map, empty beacon list)
    /// report [`FusionError::is_bad_request`]; solver and store failures are
    /// server-side errors.
    pub async fn filtered_location(
        &self,
        request: &LocationRequest,
    ) -> Result<TrackingData, FusionError> {
        if request.algorithm != ALGORITHM_PARTICLE_FILTER_VELOCITY {
            return Err(FusionError::UnknownAlgorithm(request.algorithm.clone()));
        }
        if request.beacons.is_empty() {
            return Err(FusionError::NoBeacons);
        }

        let map_config = self.store.fetch_map_config(request.map_id).await?;
        let anchors = self.store.edge_anchors(&request.edges).await?;
        let observations = self
            .store
            .average_rssi_with_distance(&request.beacons, &request.edges, request.request_time)
            .await?;

        // Anchors come back ordered by edge id; index them for lookup
        let mut sorted_edges = request.edges.clone();
        sorted_edges.sort_unstable();
        sorted_edges.dedup();
        let anchor_by_edge: HashMap<i64, [f64; 3]> =
            sorted_edges.iter().copied().zip(anchors).collect();

        let mut raw_points = Vec::with_capacity(request.beacons.len());
        for &beacon in &request.beacons {
            let mut beacon_anchors = Vec::new();
            let mut distances = Vec::new();
            for obs in observations.iter().filter(|obs| obs.beacon == beacon) {
                if let Some(anchor) = anchor_by_edge.get(&obs.edge) {
                    beacon_anchors.push(*anchor);
                    distances.push(obs.dist);
                }
            }
            if beacon_anchors.len() < 3 {
                return Err(FusionError::TooFewObservations {
                    beacon,
                    got: beacon_anchors.len(),
                });
            }
            let point = trilat::solve(&beacon_anchors, &distances)
                .map_err(|source| FusionError::Trilateration { beacon, source })?;
            tracing::debug!(beacon, x = point[0], y = point[1], "trilaterated");
            raw_points.push((beacon, [point[0], point[1]]));
        }

        let limits = Limits::from_array(map_config.limits);
        let (session_id, smoothed) =
            self.sessions.smooth(request.session_id.as_deref(), limits, &raw_points);

        let series = raw_points
            .iter()
            .zip(smoothed)
            .map(|(&(beacon, _), location)| TimeSeriesPoint {
                beacon,
                time: request.request_time,
                location,
            })
            .collect();

        Ok(TrackingData {
            session_id,
            request_time: request.request_time,
            beacons: request.beacons.clone(),
            edges: request.edges.clone(),
            series,
            map_config,
        })
    }

    /// Number of live filter sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Force-expire all sessions (test support).
    pub fn expire_sessions(&self) {
        self.sessions.expire_all();
    }
}
