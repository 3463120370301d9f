//! ReplicaStore - the in-memory authoritative state of one replica.
//!
//! The store holds every record (tombstones included) and every conflict.
//! Local edits go through [`ReplicaStore::create`], [`ReplicaStore::edit`]
//! and [`ReplicaStore::delete`], which stamp the owning device. Replicated
//! writes use [`ReplicaStore::compare_and_swap`], keyed by the vector clock
//! the writer last observed, so two writers racing on one record cannot
//! silently overwrite each other.

use crate::{
    error::Result, Conflict, ConflictId, DeviceId, Error, Fields, Record, RecordId,
    ResolutionChoice, ConflictResolver, StoreSnapshot, Timestamp, VectorClock,
};
use std::collections::HashMap;

/// The main store holding one replica's state.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    /// Device owning this replica
    device_id: DeviceId,
    /// Records by id, tombstones included
    records: HashMap<RecordId, Record>,
    /// Conflicts by record id, resolved ones kept as history
    conflicts: HashMap<ConflictId, Conflict>,
}

impl ReplicaStore {
    /// Create an empty store for `device_id`.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            records: HashMap::new(),
            conflicts: HashMap::new(),
        }
    }

    /// Get the device ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Create a record authored by this device.
    pub fn create(
        &mut self,
        id: impl Into<RecordId>,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<Record> {
        let id = id.into();
        if self.records.contains_key(&id) {
            return Err(Error::RecordAlreadyExists(id));
        }
        let record = Record::new(id.clone(), fields, self.device_id.clone(), timestamp);
        self.records.insert(id, record.clone());
        Ok(record)
    }

    /// Merge `changes` into an active record.
    pub fn edit(&mut self, id: &str, changes: Fields, timestamp: Timestamp) -> Result<Record> {
        let device = self.device_id.clone();
        let record = self.active_mut(id)?;
        record.edit(&device, changes, timestamp);
        Ok(record.clone())
    }

    /// Soft-delete a record. Deleting a tombstone is a no-op.
    pub fn delete(&mut self, id: &str, timestamp: Timestamp) -> Result<Record> {
        let device = self.device_id.clone();
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        if !record.deleted {
            record.mark_deleted(&device, timestamp);
        }
        Ok(record.clone())
    }

    fn active_mut(&mut self, id: &str) -> Result<&mut Record> {
        self.records
            .get_mut(id)
            .filter(|r| r.is_active())
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))
    }

    // ------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------

    /// Get a record by ID, tombstones included.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Get a record only if it is not deleted.
    pub fn get_active(&self, id: &str) -> Option<&Record> {
        self.get(id).filter(|r| r.is_active())
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Replace a record only if its stored clock still equals `expected`
    /// (`None` meaning "not stored yet").
    pub fn compare_and_swap(
        &mut self,
        record: Record,
        expected: Option<&VectorClock>,
    ) -> Result<()> {
        let current = self.records.get(&record.id).map(|r| &r.clock);
        if current != expected {
            return Err(Error::ClockConflict(record.id));
        }
        self.upsert(record);
        Ok(())
    }

    /// All records including tombstones.
    pub fn all(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// All non-deleted records.
    pub fn active(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Records carrying changes not yet acknowledged by a remote replica.
    pub fn dirty_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.sync.dirty)
    }

    /// Mark records acknowledged, but only where the acknowledged clock is
    /// still the stored one. Returns how many records changed.
    pub fn mark_acknowledged(&mut self, acked: &[(RecordId, VectorClock)]) -> usize {
        let mut count = 0;
        for (id, clock) in acked {
            if let Some(record) = self.records.get_mut(id) {
                if &record.clock == clock {
                    record.sync.acknowledged = true;
                    record.sync.dirty = false;
                    count += 1;
                }
            }
        }
        count
    }

    /// Pointwise maximum over every record clock.
    pub fn summary_clock(&self) -> VectorClock {
        self.records
            .values()
            .fold(VectorClock::new(), |acc, r| acc.merge(&r.clock))
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active().count()
    }

    /// Check if the store has no active records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Unresolved conflicts.
    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values().filter(|c| !c.is_resolved())
    }

    /// Every conflict, resolved ones included.
    pub fn all_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values()
    }

    /// Get a conflict by record ID.
    pub fn conflict(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    /// Get the conflict for `id` only if it is still open.
    pub fn open_conflict(&self, id: &str) -> Option<&Conflict> {
        self.conflict(id).filter(|c| !c.is_resolved())
    }

    /// Insert or replace a conflict.
    pub fn upsert_conflict(&mut self, conflict: Conflict) {
        self.conflicts.insert(conflict.id.clone(), conflict);
    }

    /// Remove a conflict.
    pub fn delete_conflict(&mut self, id: &str) -> Result<Conflict> {
        self.conflicts
            .remove(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))
    }

    /// Settle an open conflict and write the result back as the
    /// authoritative record.
    pub fn resolve_conflict(
        &mut self,
        resolver: &ConflictResolver,
        id: &str,
        choice: ResolutionChoice,
        timestamp: Timestamp,
    ) -> Result<Record> {
        let conflict = self
            .conflicts
            .get(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        let (record, resolved) = resolver.resolve_conflict(conflict, choice, timestamp)?;
        self.upsert(record.clone());
        self.upsert_conflict(resolved);
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Export the current state as a snapshot.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(self.device_id.clone());
        for record in self.records.values() {
            snapshot.add_record(record.clone());
        }
        for conflict in self.conflicts.values() {
            snapshot.add_conflict(conflict.clone());
        }
        snapshot
    }

    /// Rebuild a store from a snapshot.
    pub fn import_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        snapshot.validate()?;
        Ok(Self {
            device_id: snapshot.device_id,
            records: snapshot.records.into_iter().collect(),
            conflicts: snapshot.conflicts.into_iter().collect(),
        })
    }
}
