//! Snapshot types for persisting and restoring replica state.
//!
//! Snapshots are the bridge between the in-memory ReplicaStore and
//! persistent storage. They are designed for deterministic serialization.

use crate::{error::Result, Conflict, ConflictId, DeviceId, Error, Record, RecordId, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a replica.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Device owning the replica
    pub device_id: DeviceId,
    /// All records by ID, tombstones included
    pub records: BTreeMap<RecordId, Record>,
    /// All conflicts by record ID
    #[serde(default)]
    pub conflicts: BTreeMap<ConflictId, Conflict>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: device_id.into(),
            records: BTreeMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Add a conflict to the snapshot.
    pub fn add_conflict(&mut self, conflict: Conflict) {
        self.conflicts.insert(conflict.id.clone(), conflict);
    }

    /// Count total records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records.values().filter(|r| r.is_active()).count()
    }

    /// Check internal consistency: format version and keys matching ids.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::SnapshotVersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                actual: self.format_version,
            });
        }
        if let Some((key, record)) = self.records.iter().find(|(k, r)| **k != r.id) {
            return Err(Error::InvalidSnapshot(format!(
                "record stored under '{key}' has id '{}'",
                record.id
            )));
        }
        if let Some((key, _)) = self
            .conflicts
            .iter()
            .find(|(k, c)| **k != c.id || c.versions.is_empty())
        {
            return Err(Error::InvalidSnapshot(format!(
                "conflict '{key}' is malformed"
            )));
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub device_id: DeviceId,
    /// Merge of every record clock
    pub summary_clock: VectorClock,
    pub record_count: usize,
    pub active_record_count: usize,
    /// Unresolved conflicts only
    pub open_conflicts: usize,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            device_id: snapshot.device_id.clone(),
            summary_clock: snapshot
                .records
                .values()
                .fold(VectorClock::new(), |acc, r| acc.merge(&r.clock)),
            record_count: snapshot.record_count(),
            active_record_count: snapshot.active_record_count(),
            open_conflicts: snapshot.conflicts.values().filter(|c| !c.is_resolved()).count(),
        }
    }
}
