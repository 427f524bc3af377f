//! Storage abstraction for the Waypost beacon pipeline.
//!
//! The relational persistence layer is an external collaborator; the core
//! depends only on the [`Store`] trait defined here. [`MemoryStore`] is a
//! complete in-memory implementation backing the `memory` driver and the
//! test suites.
//!
//! Besides plain persistence, the store owns two pieces of derived data the
//! rest of the system treats as queries: time-bracketed RSSI averaging (with
//! the per-edge log-distance path-loss model applied, see [`pathloss`]) and
//! the rate-collapsing error ledger.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
pub mod pathloss;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use types::{
    ErrorEntry, ErrorKind, ErrorLevel, ErrorReport, MapConfig, PendingControl, RssiObservation,
    Sample,
};
use waypost_proto::{BeaconData, Uuid};

/// The persistence operations the pipeline core depends on.
///
/// Implementations are expected to open their backing connections briefly,
/// per operation; callers hold an `Arc<dyn Store>` and issue operations
/// concurrently from independent connection tasks.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a batch of samples for an edge, in the given order.
    async fn insert_samples(&self, edge_id: i64, samples: &[Sample]) -> Result<(), StoreError>;

    /// Resolve iBeacon triples to surrogate ids, preserving order.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownBeacon`] when any triple is not registered.
    async fn resolve_beacon_ids(&self, triples: &[BeaconData]) -> Result<Vec<i64>, StoreError>;

    /// Resolve an edge UUID to its surrogate id.
    async fn resolve_edge_id(&self, uuid: Uuid) -> Result<i64, StoreError>;

    /// Update the edge's `last_seen` to now.
    async fn touch_edge_last_seen(&self, uuid: Uuid) -> Result<(), StoreError>;

    /// All registered beacons.
    async fn list_beacons(&self) -> Result<Vec<BeaconData>, StoreError>;

    /// The oldest not-yet-completed control command for an edge, if any.
    async fn next_pending_control(
        &self,
        edge_id: i64,
    ) -> Result<Option<PendingControl>, StoreError>;

    /// Append a free-form control log row for an edge.
    async fn insert_control_log(&self, edge_id: i64, text: &str) -> Result<(), StoreError>;

    /// Latch a control command to completed and record its output.
    ///
    /// Completion is one-way and idempotent: repeating it for an already
    /// completed command leaves stored state unchanged.
    async fn complete_control(
        &self,
        edge_id: i64,
        control_id: i64,
        output: &str,
    ) -> Result<(), StoreError>;

    /// Record an error, collapsing repeats.
    ///
    /// If the newest entry with the same `(edge, kind)` is younger than
    /// `window`, its count is bumped instead of inserting a new row.
    async fn record_error(&self, report: ErrorReport, window: Duration) -> Result<(), StoreError>;

    /// Ledger entries with id greater than `last_id`, in id order, plus the
    /// new high-water mark. `last_id == 0` returns the last 10 minutes.
    async fn errors_since(
        &self,
        last_id: i64,
    ) -> Result<(Vec<ErrorEntry>, i64), StoreError>;

    /// Ids of edges whose `last_seen` is older than `threshold`.
    async fn inactive_edges(&self, threshold: Duration) -> Result<Vec<i64>, StoreError>;

    /// Time-bracketed mean RSSI with path-loss distance for each requested
    /// `(beacon, edge)` pair around `at`, ordered by beacon then edge.
    ///
    /// Pairs with no samples in the bracket window are omitted.
    async fn average_rssi_with_distance(
        &self,
        beacons: &[i64],
        edges: &[i64],
        at: DateTime<Utc>,
    ) -> Result<Vec<RssiObservation>, StoreError>;

    /// 3-D anchor positions for the given edges, ordered by edge id.
    async fn edge_anchors(&self, edges: &[i64]) -> Result<Vec<[f64; 3]>, StoreError>;

    /// Map configuration by id.
    async fn fetch_map_config(&self, map_id: i64) -> Result<MapConfig, StoreError>;

    /// Map background image bytes by id.
    async fn fetch_map_image(&self, map_id: i64) -> Result<Vec<u8>, StoreError>;
}

/// Open a store by driver name.
///
/// The `memory` driver ignores its datasource string. Relational drivers
/// live outside this workspace; asking for one is a startup error.
pub fn open(driver: &str, datasource: &str) -> Result<std::sync::Arc<dyn Store>, StoreError> {
    match driver {
        "memory" => {
            let _ = datasource;
            Ok(std::sync::Arc::new(MemoryStore::new()))
        },
        other => Err(StoreError::UnknownDriver(other.to_string())),
    }
}
