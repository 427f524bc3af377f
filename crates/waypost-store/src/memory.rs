//! In-memory store implementation.
//!
//! Backs the `memory` driver and every test suite. All state lives behind a
//! single `Arc<Mutex<_>>` so clones share one store; operations are brief
//! synchronous critical sections with no await points while locked.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use waypost_proto::{BeaconData, Uuid};

use crate::{
    ErrorEntry, ErrorReport, MapConfig, PendingControl, RssiObservation, Sample, Store,
    StoreError, pathloss::PathModel,
};

/// Width of an averaging bracket in seconds.
const DEFAULT_BRACKET_SECONDS: i64 = 10;

/// Ledger window returned by `errors_since(0)`.
const INITIAL_ERROR_WINDOW: Duration = Duration::from_secs(600);

struct EdgeRow {
    id: i64,
    uuid: Uuid,
    last_seen: DateTime<Utc>,
    model: PathModel,
    anchor: [f64; 3],
}

struct BeaconRow {
    id: i64,
    data: BeaconData,
    #[allow(dead_code)]
    label: String,
}

struct SampleRow {
    edge_id: i64,
    sample: Sample,
}

struct ControlRow {
    id: i64,
    edge_id: i64,
    data_in: String,
    data_out: Option<String>,
    completed: bool,
    enqueued_at: DateTime<Utc>,
}

struct ControlLogRow {
    edge_id: i64,
    text: String,
    #[allow(dead_code)]
    at: DateTime<Utc>,
}

struct MemoryStoreInner {
    edges: Vec<EdgeRow>,
    beacons: Vec<BeaconRow>,
    samples: Vec<SampleRow>,
    controls: Vec<ControlRow>,
    control_logs: Vec<ControlLogRow>,
    errors: Vec<ErrorEntry>,
    maps: HashMap<i64, (MapConfig, Vec<u8>)>,
    next_edge_id: i64,
    next_beacon_id: i64,
    next_control_id: i64,
    next_error_id: i64,
    bracket_seconds: i64,
}

/// In-memory [`Store`] implementation.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    /// Create an empty store with the default bracket width.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bracket_seconds(DEFAULT_BRACKET_SECONDS)
    }

    /// Create an empty store with an explicit averaging bracket width.
    #[must_use]
    pub fn with_bracket_seconds(bracket_seconds: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner {
                edges: Vec::new(),
                beacons: Vec::new(),
                samples: Vec::new(),
                controls: Vec::new(),
                control_logs: Vec::new(),
                errors: Vec::new(),
                maps: HashMap::new(),
                next_edge_id: 1,
                next_beacon_id: 1,
                next_control_id: 1,
                next_error_id: 1,
                bracket_seconds,
            })),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("Mutex poisoned")
    }

    /// Register an edge; returns its surrogate id.
    pub fn add_edge(&self, uuid: Uuid, bias: f64, gamma: f64, anchor: [f64; 3]) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_edge_id;
        inner.next_edge_id += 1;
        inner.edges.push(EdgeRow {
            id,
            uuid,
            last_seen: Utc::now(),
            model: PathModel { bias, gamma },
            anchor,
        });
        id
    }

    /// Register a beacon; returns its surrogate id.
    pub fn add_beacon(&self, data: BeaconData, label: &str) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_beacon_id;
        inner.next_beacon_id += 1;
        inner.beacons.push(BeaconRow { id, data, label: label.to_string() });
        id
    }

    /// Register a map configuration with its background image.
    pub fn add_map(&self, config: MapConfig, image: Vec<u8>) {
        self.lock().maps.insert(config.id, (config, image));
    }

    /// Enqueue a control command for an edge; returns the command id.
    pub fn enqueue_control(&self, edge_id: i64, text: &str) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_control_id;
        inner.next_control_id += 1;
        inner.controls.push(ControlRow {
            id,
            edge_id,
            data_in: text.to_string(),
            data_out: None,
            completed: false,
            enqueued_at: Utc::now(),
        });
        id
    }

    /// Backdate an edge's `last_seen` (test support for inactivity checks).
    pub fn set_edge_last_seen(&self, uuid: Uuid, at: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(edge) = inner.edges.iter_mut().find(|e| e.uuid == uuid) {
            edge.last_seen = at;
        }
    }

    /// Number of stored samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    /// Stored samples for one edge, in insertion order.
    #[must_use]
    pub fn samples_for_edge(&self, edge_id: i64) -> Vec<Sample> {
        self.lock()
            .samples
            .iter()
            .filter(|row| row.edge_id == edge_id)
            .map(|row| row.sample)
            .collect()
    }

    /// Completion state and output of a control command.
    #[must_use]
    pub fn control_state(&self, control_id: i64) -> Option<(bool, Option<String>)> {
        self.lock()
            .controls
            .iter()
            .find(|row| row.id == control_id)
            .map(|row| (row.completed, row.data_out.clone()))
    }

    /// Control log rows for one edge.
    #[must_use]
    pub fn control_logs_for_edge(&self, edge_id: i64) -> Vec<String> {
        self.lock()
            .control_logs
            .iter()
            .filter(|row| row.edge_id == edge_id)
            .map(|row| row.text.clone())
            .collect()
    }

    /// Snapshot of all ledger entries.
    #[must_use]
    pub fn error_entries(&self) -> Vec<ErrorEntry> {
        self.lock().errors.clone()
    }

    /// `last_seen` of an edge.
    #[must_use]
    pub fn edge_last_seen(&self, uuid: Uuid) -> Option<DateTime<Utc>> {
        self.lock().edges.iter().find(|e| e.uuid == uuid).map(|e| e.last_seen)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    /// Bracket start for an instant: `floor(epoch/Δ)·Δ`.
    fn bracket(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.bracket_seconds) * self.bracket_seconds
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_samples(&self, edge_id: i64, samples: &[Sample]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.edges.iter().any(|e| e.id == edge_id) {
            return Err(StoreError::Backend(format!("edge id {edge_id} not present")));
        }
        inner
            .samples
            .extend(samples.iter().map(|&sample| SampleRow { edge_id, sample }));
        Ok(())
    }

    async fn resolve_beacon_ids(&self, triples: &[BeaconData]) -> Result<Vec<i64>, StoreError> {
        let inner = self.lock();
        triples
            .iter()
            .map(|triple| {
                inner
                    .beacons
                    .iter()
                    .find(|row| row.data == *triple)
                    .map(|row| row.id)
                    .ok_or(StoreError::UnknownBeacon {
                        uuid: triple.uuid,
                        major: triple.major,
                        minor: triple.minor,
                    })
            })
            .collect()
    }

    async fn resolve_edge_id(&self, uuid: Uuid) -> Result<i64, StoreError> {
        self.lock()
            .edges
            .iter()
            .find(|e| e.uuid == uuid)
            .map(|e| e.id)
            .ok_or(StoreError::UnknownEdge(uuid))
    }

    async fn touch_edge_last_seen(&self, uuid: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let edge = inner
            .edges
            .iter_mut()
            .find(|e| e.uuid == uuid)
            .ok_or(StoreError::UnknownEdge(uuid))?;
        edge.last_seen = Utc::now();
        Ok(())
    }

    async fn list_beacons(&self) -> Result<Vec<BeaconData>, StoreError> {
        Ok(self.lock().beacons.iter().map(|row| row.data).collect())
    }

    async fn next_pending_control(
        &self,
        edge_id: i64,
    ) -> Result<Option<PendingControl>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .controls
            .iter()
            .filter(|row| row.edge_id == edge_id && !row.completed)
            .min_by_key(|row| (row.enqueued_at, row.id))
            .map(|row| PendingControl { id: row.id, text: row.data_in.clone() }))
    }

    async fn insert_control_log(&self, edge_id: i64, text: &str) -> Result<(), StoreError> {
        self.lock().control_logs.push(ControlLogRow {
            edge_id,
            text: text.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn complete_control(
        &self,
        edge_id: i64,
        control_id: i64,
        output: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(row) = inner
            .controls
            .iter_mut()
            .find(|row| row.id == control_id && row.edge_id == edge_id)
        else {
            tracing::warn!(control_id, edge_id, "completion for unknown control command");
            return Ok(());
        };
        // One-way latch: a repeated completion leaves the first output intact
        if !row.completed {
            row.completed = true;
            row.data_out = Some(output.to_string());
        }
        Ok(())
    }

    async fn record_error(&self, report: ErrorReport, window: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(window)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

        let collapsed = inner
            .errors
            .iter_mut()
            .rev()
            .find(|entry| entry.edge_id == report.edge_id && entry.kind == report.kind)
            .filter(|entry| entry.at >= cutoff);
        if let Some(entry) = collapsed {
            entry.count += 1;
            return Ok(());
        }

        let id = inner.next_error_id;
        inner.next_error_id += 1;
        inner.errors.push(ErrorEntry {
            id,
            at: now,
            kind: report.kind,
            level: report.level,
            text: report.text,
            edge_id: report.edge_id,
            count: 1,
        });
        Ok(())
    }

    async fn errors_since(
        &self,
        last_id: i64,
    ) -> Result<(Vec<ErrorEntry>, i64), StoreError> {
        let inner = self.lock();
        let entries: Vec<ErrorEntry> = if last_id == 0 {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(INITIAL_ERROR_WINDOW)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            inner.errors.iter().filter(|e| e.at >= cutoff).cloned().collect()
        } else {
            inner.errors.iter().filter(|e| e.id > last_id).cloned().collect()
        };
        let new_last_id = entries.last().map_or(last_id, |e| e.id);
        Ok((entries, new_last_id))
    }

    async fn inactive_edges(&self, threshold: Duration) -> Result<Vec<i64>, StoreError> {
        let inner = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut ids: Vec<i64> = inner
            .edges
            .iter()
            .filter(|e| e.last_seen < cutoff)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn average_rssi_with_distance(
        &self,
        beacons: &[i64],
        edges: &[i64],
        at: DateTime<Utc>,
    ) -> Result<Vec<RssiObservation>, StoreError> {
        let inner = self.lock();
        let bracket = inner.bracket(at);
        let previous = bracket - inner.bracket_seconds;

        let mut sorted_beacons = beacons.to_vec();
        sorted_beacons.sort_unstable();
        sorted_beacons.dedup();
        let mut sorted_edges = edges.to_vec();
        sorted_edges.sort_unstable();
        sorted_edges.dedup();

        let mut out = Vec::new();
        for &beacon in &sorted_beacons {
            for &edge in &sorted_edges {
                let mut sum: i64 = 0;
                let mut count: i64 = 0;
                for row in &inner.samples {
                    if row.edge_id != edge || row.sample.beacon_id != beacon {
                        continue;
                    }
                    let sample_bracket = inner.bracket(row.sample.at);
                    if sample_bracket == bracket || sample_bracket == previous {
                        sum += i64::from(row.sample.rssi);
                        count += 1;
                    }
                }
                if count == 0 {
                    continue;
                }
                // Integer-division mean, matching the relational aggregate
                let mean = sum / count;
                let model = inner
                    .edges
                    .iter()
                    .find(|e| e.id == edge)
                    .map(|e| e.model)
                    .ok_or_else(|| StoreError::Backend(format!("edge id {edge} not present")))?;
                out.push(RssiObservation {
                    beacon,
                    edge,
                    rssi: mean as f64,
                    dist: model.distance(mean as f64),
                });
            }
        }
        Ok(out)
    }

    async fn edge_anchors(&self, edges: &[i64]) -> Result<Vec<[f64; 3]>, StoreError> {
        let inner = self.lock();
        let mut sorted = edges.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .iter()
            .map(|&id| {
                inner
                    .edges
                    .iter()
                    .find(|e| e.id == id)
                    .map(|e| e.anchor)
                    .ok_or_else(|| StoreError::Backend(format!("edge id {id} not present")))
            })
            .collect()
    }

    async fn fetch_map_config(&self, map_id: i64) -> Result<MapConfig, StoreError> {
        self.lock()
            .maps
            .get(&map_id)
            .map(|(config, _)| config.clone())
            .ok_or(StoreError::UnknownMap(map_id))
    }

    async fn fetch_map_image(&self, map_id: i64) -> Result<Vec<u8>, StoreError> {
        self.lock()
            .maps
            .get(&map_id)
            .map(|(_, image)| image.clone())
            .ok_or(StoreError::UnknownMap(map_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn beacon(byte: u8, major: u16, minor: u16) -> BeaconData {
        BeaconData { uuid: Uuid::from_bytes([byte; 16]), major, minor }
    }

    #[tokio::test]
    async fn resolves_by_full_triple() {
        let store = MemoryStore::new();
        let id = store.add_beacon(beacon(0x5a, 1, 1), "door");
        store.add_beacon(beacon(0x5a, 1, 2), "desk");

        let resolved = store.resolve_beacon_ids(&[beacon(0x5a, 1, 1)]).await.unwrap();
        assert_eq!(resolved, vec![id]);

        // Same uuid, unregistered minor
        let missing = store.resolve_beacon_ids(&[beacon(0x5a, 9, 9)]).await;
        assert!(matches!(missing, Err(StoreError::UnknownBeacon { .. })));
    }

    #[tokio::test]
    async fn unknown_edge_is_a_lookup_miss() {
        let store = MemoryStore::new();
        let err = store.resolve_edge_id(Uuid::from_bytes([1; 16])).await.unwrap_err();
        assert!(err.is_unknown_entity());
    }

    #[tokio::test]
    async fn pending_control_is_oldest_first() {
        let store = MemoryStore::new();
        let edge = store.add_edge(Uuid::from_bytes([1; 16]), -59.0, 2.0, [0.0, 0.0, 1.0]);
        let first = store.enqueue_control(edge, "[\"echo\",\"one\"]");
        let second = store.enqueue_control(edge, "[\"echo\",\"two\"]");

        let pending = store.next_pending_control(edge).await.unwrap().unwrap();
        assert_eq!(pending.id, first);

        store.complete_control(edge, first, "one\n").await.unwrap();
        let pending = store.next_pending_control(edge).await.unwrap().unwrap();
        assert_eq!(pending.id, second);
    }

    #[tokio::test]
    async fn completion_is_an_idempotent_latch() {
        let store = MemoryStore::new();
        let edge = store.add_edge(Uuid::from_bytes([1; 16]), -59.0, 2.0, [0.0, 0.0, 1.0]);
        let id = store.enqueue_control(edge, "[\"true\"]");

        store.complete_control(edge, id, "first output").await.unwrap();
        store.complete_control(edge, id, "second output").await.unwrap();

        let (completed, output) = store.control_state(id).unwrap();
        assert!(completed);
        assert_eq!(output.as_deref(), Some("first output"));

        // Unknown command id is tolerated
        store.complete_control(edge, 999, "ignored").await.unwrap();
    }

    #[tokio::test]
    async fn ledger_collapses_within_window() {
        let store = MemoryStore::new();
        let report = || ErrorReport {
            kind: crate::ErrorKind::Desync,
            level: crate::ErrorLevel::Warn,
            text: "clock drift".to_string(),
            edge_id: Some(1),
        };
        let window = Duration::from_secs(120);

        store.record_error(report(), window).await.unwrap();
        store.record_error(report(), window).await.unwrap();
        store.record_error(report(), window).await.unwrap();

        let entries = store.error_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 3);

        // Different edge starts a fresh entry
        let mut other = report();
        other.edge_id = Some(2);
        store.record_error(other, window).await.unwrap();
        assert_eq!(store.error_entries().len(), 2);
    }

    #[tokio::test]
    async fn errors_since_advances_the_high_water_mark() {
        let store = MemoryStore::new();
        let report = |edge| ErrorReport {
            kind: crate::ErrorKind::UnknownBeacon,
            level: crate::ErrorLevel::Error,
            text: "bad triple".to_string(),
            edge_id: Some(edge),
        };
        store.record_error(report(1), Duration::from_secs(1)).await.unwrap();
        store.record_error(report(2), Duration::from_secs(1)).await.unwrap();

        let (entries, mark) = store.errors_since(0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(mark, entries.last().unwrap().id);

        let (rest, new_mark) = store.errors_since(mark).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(new_mark, mark);
    }

    #[tokio::test]
    async fn averaging_is_bracketed_and_idempotent() {
        let store = MemoryStore::with_bracket_seconds(10);
        let edge = store.add_edge(Uuid::from_bytes([1; 16]), -59.0, 2.0, [0.0, 0.0, 1.0]);
        let beacon_id = store.add_beacon(beacon(0x5a, 1, 1), "door");

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 15).unwrap();
        let samples = vec![
            Sample { at, beacon_id, rssi: -60 },
            Sample { at, beacon_id, rssi: -63 },
            // Previous bracket, still included
            Sample { at: at - chrono::Duration::seconds(12), beacon_id, rssi: -60 },
            // Two brackets back, excluded
            Sample { at: at - chrono::Duration::seconds(25), beacon_id, rssi: -10 },
        ];
        store.insert_samples(edge, &samples).await.unwrap();

        let obs = store
            .average_rssi_with_distance(&[beacon_id], &[edge], at)
            .await
            .unwrap();
        assert_eq!(obs.len(), 1);
        // (-60 + -63 + -60) / 3 with integer division
        assert!((obs[0].rssi - (-61.0)).abs() < f64::EPSILON);

        // Feeding the identical samples again must not move the mean
        store.insert_samples(edge, &samples).await.unwrap();
        let again = store
            .average_rssi_with_distance(&[beacon_id], &[edge], at)
            .await
            .unwrap();
        assert!((again[0].rssi - obs[0].rssi).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn observations_are_ordered_by_beacon_then_edge() {
        let store = MemoryStore::new();
        let edge_a = store.add_edge(Uuid::from_bytes([1; 16]), -59.0, 2.0, [0.0, 0.0, 1.0]);
        let edge_b = store.add_edge(Uuid::from_bytes([2; 16]), -59.0, 2.0, [5.0, 0.0, 1.0]);
        let b1 = store.add_beacon(beacon(0x5a, 1, 1), "one");
        let b2 = store.add_beacon(beacon(0x5b, 2, 2), "two");

        let at = Utc::now();
        for edge in [edge_a, edge_b] {
            for beacon_id in [b1, b2] {
                store
                    .insert_samples(edge, &[Sample { at, beacon_id, rssi: -60 }])
                    .await
                    .unwrap();
            }
        }

        // Request order is scrambled; result order is sorted
        let obs = store
            .average_rssi_with_distance(&[b2, b1], &[edge_b, edge_a], at)
            .await
            .unwrap();
        let pairs: Vec<(i64, i64)> = obs.iter().map(|o| (o.beacon, o.edge)).collect();
        assert_eq!(pairs, vec![(b1, edge_a), (b1, edge_b), (b2, edge_a), (b2, edge_b)]);
    }

    #[tokio::test]
    async fn anchors_are_ordered_by_edge_id() {
        let store = MemoryStore::new();
        let edge_a = store.add_edge(Uuid::from_bytes([1; 16]), -59.0, 2.0, [0.0, 0.0, 1.0]);
        let edge_b = store.add_edge(Uuid::from_bytes([2; 16]), -59.0, 2.0, [10.0, 0.0, 1.0]);

        let anchors = store.edge_anchors(&[edge_b, edge_a]).await.unwrap();
        assert_eq!(anchors, vec![[0.0, 0.0, 1.0], [10.0, 0.0, 1.0]]);
    }

    #[tokio::test]
    async fn inactive_edges_respect_threshold() {
        let store = MemoryStore::new();
        let uuid_stale = Uuid::from_bytes([1; 16]);
        let stale = store.add_edge(uuid_stale, -59.0, 2.0, [0.0; 3]);
        let _fresh = store.add_edge(Uuid::from_bytes([2; 16]), -59.0, 2.0, [0.0; 3]);

        store.set_edge_last_seen(uuid_stale, Utc::now() - chrono::Duration::minutes(11));
        let inactive = store.inactive_edges(Duration::from_secs(600)).await.unwrap();
        assert_eq!(inactive, vec![stale]);
    }

    #[tokio::test]
    async fn map_config_round_trips_as_json() {
        let store = MemoryStore::new();
        let config = MapConfig {
            id: 1,
            title: "second floor".to_string(),
            coord_bias_x: 0,
            coord_bias_y: 0,
            coord_scale_x: 1.0,
            coord_scale_y: -1.0,
            limits: [0.0, 10.0, 0.0, 10.0],
            edges: vec![1, 2, 3],
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: MapConfig = serde_json::from_str(&encoded).unwrap();
        store.add_map(decoded, vec![0xFF, 0xD8]);

        let fetched = store.fetch_map_config(1).await.unwrap();
        assert_eq!(fetched, config);
        assert_eq!(store.fetch_map_image(1).await.unwrap(), vec![0xFF, 0xD8]);
        assert!(matches!(
            store.fetch_map_config(9).await,
            Err(StoreError::UnknownMap(9))
        ));
    }

    #[test]
    fn driver_selection() {
        assert!(crate::open("memory", "").is_ok());
        assert!(matches!(
            crate::open("postgres", "host=..."),
            Err(StoreError::UnknownDriver(_))
        ));
    }
}
