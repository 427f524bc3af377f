//! Sample batch buffer with per-batch beacon dedup.
//!
//! Logs reference beacons by index into the packet's beacon table, so the
//! buffer keeps a `triple → index` map and appends each distinct beacon
//! once. The buffer is taken atomically at flush: the returned packet owns
//! the accumulated data and the buffer starts over empty.

use std::collections::HashMap;

use waypost_proto::{
    BeaconData, BeaconLog, BeaconLogPacket, MAX_BEACONS, MAX_LOGS, Uuid,
};

use crate::scanner::BeaconRecord;

/// Accumulates scan records into the next uplink packet.
pub struct BatchBuffer {
    uuid: Uuid,
    beacons: Vec<BeaconData>,
    index: HashMap<BeaconData, u16>,
    logs: Vec<BeaconLog>,
}

impl BatchBuffer {
    /// An empty buffer stamping packets with the given edge identity.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, beacons: Vec::new(), index: HashMap::new(), logs: Vec::new() }
    }

    /// Append one scan record, deduplicating its beacon.
    pub fn push(&mut self, record: &BeaconRecord) {
        let next_index = self.beacons.len() as u16;
        let beacon_index = *self.index.entry(record.data).or_insert_with(|| {
            self.beacons.push(record.data);
            next_index
        });
        self.logs.push(BeaconLog { at: record.at, rssi: record.rssi, beacon_index });
    }

    /// True when there is nothing to flush.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// True when either protocol cap is reached and the buffer must flush
    /// before accepting more records.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.beacons.len() >= MAX_BEACONS || self.logs.len() >= MAX_LOGS
    }

    /// Distinct beacons currently in the table.
    #[must_use]
    pub fn beacon_count(&self) -> usize {
        self.beacons.len()
    }

    /// Take the accumulated batch as a packet, leaving the buffer empty.
    #[must_use]
    pub fn take(&mut self) -> BeaconLogPacket {
        let mut packet = BeaconLogPacket::new(self.uuid);
        packet.beacons = std::mem::take(&mut self.beacons);
        packet.logs = std::mem::take(&mut self.logs);
        self.index.clear();
        packet
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(byte: u8, rssi: i16) -> BeaconRecord {
        BeaconRecord {
            data: BeaconData { uuid: Uuid::from_bytes([byte; 16]), major: 1, minor: 1 },
            at: Utc::now(),
            rssi,
        }
    }

    #[test]
    fn dedups_beacons_into_compact_indices() {
        let mut batch = BatchBuffer::new(Uuid::default());
        batch.push(&record(1, -50));
        batch.push(&record(2, -60));
        batch.push(&record(1, -55));

        let packet = batch.take();
        assert_eq!(packet.beacons.len(), 2);
        assert_eq!(packet.logs.len(), 3);
        assert_eq!(packet.logs[0].beacon_index, 0);
        assert_eq!(packet.logs[1].beacon_index, 1);
        assert_eq!(packet.logs[2].beacon_index, 0);
        assert_eq!(packet.logs[2].rssi, -55);
    }

    #[test]
    fn take_resets_the_buffer() {
        let mut batch = BatchBuffer::new(Uuid::default());
        batch.push(&record(1, -50));
        let first = batch.take();
        assert_eq!(first.logs.len(), 1);
        assert!(batch.is_empty());

        // Indices restart from zero after a flush
        batch.push(&record(2, -60));
        let second = batch.take();
        assert_eq!(second.logs[0].beacon_index, 0);
        assert_eq!(second.beacons[0].uuid, Uuid::from_bytes([2; 16]));
    }

    #[test]
    fn reports_full_at_the_beacon_cap() {
        let mut batch = BatchBuffer::new(Uuid::default());
        for i in 0..MAX_BEACONS {
            assert!(!batch.is_full());
            let mut data = [0u8; 16];
            data[0] = (i / 256) as u8;
            data[1] = (i % 256) as u8;
            batch.push(&BeaconRecord {
                data: BeaconData { uuid: Uuid::from_bytes(data), major: 1, minor: 1 },
                at: Utc::now(),
                rssi: -50,
            });
        }
        assert!(batch.is_full());
        assert_eq!(batch.beacon_count(), MAX_BEACONS);

        // The packet still encodes: the cap was hit, not exceeded
        assert!(batch.take().encode().is_ok());
    }

    #[test]
    fn reports_full_at_the_log_cap() {
        let mut batch = BatchBuffer::new(Uuid::default());
        for _ in 0..MAX_LOGS {
            batch.push(&record(1, -50));
        }
        assert!(batch.is_full());
        assert_eq!(batch.beacon_count(), 1);
        assert!(batch.take().encode().is_ok());
    }
}
