//! Record types for storing replicated data.

use crate::{DeviceId, RecordId, Revision, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

/// Mutable payload fields of a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Name of the boolean field used by the "prefer completed" rule.
pub const COMPLETED_FIELD: &str = "completed";

/// Replication bookkeeping for a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// A remote replica has acknowledged the current revision
    pub acknowledged: bool,
    /// The record carries local changes not yet pushed anywhere
    pub dirty: bool,
}

impl SyncState {
    /// State of a record changed on this device.
    pub fn local_change() -> Self {
        Self {
            acknowledged: false,
            dirty: true,
        }
    }

    /// State of a record adopted from a remote replica.
    pub fn received() -> Self {
        Self {
            acknowledged: true,
            dirty: false,
        }
    }
}

/// A replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable identifier, never reused
    pub id: RecordId,
    /// Payload fields (JSON object)
    pub fields: Fields,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Causal history of this record
    pub clock: VectorClock,
    /// Device that produced the current revision
    pub last_modified_by: DeviceId,
    /// Local revision counter, bumped on every change
    pub revision: Revision,
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last changed (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Replication bookkeeping
    #[serde(default)]
    pub sync: SyncState,
}

impl Record {
    /// Create a new record authored by `device`.
    pub fn new(
        id: impl Into<RecordId>,
        fields: Fields,
        device: impl Into<DeviceId>,
        timestamp: Timestamp,
    ) -> Self {
        let device = device.into();
        Self {
            id: id.into(),
            fields,
            deleted: false,
            clock: VectorClock::for_device(device.clone()),
            last_modified_by: device,
            revision: 1,
            created_at: timestamp,
            updated_at: timestamp,
            sync: SyncState::local_change(),
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Identifier of this revision, unique within a conflict.
    pub fn version_id(&self) -> String {
        format!("{}@{}", self.last_modified_by, self.revision)
    }

    /// Merge `changes` into the payload, overwriting matching keys.
    pub fn edit(&mut self, device: &str, changes: Fields, timestamp: Timestamp) {
        self.fields.extend(changes);
        self.touch(device, timestamp);
    }

    /// Replace the payload wholesale.
    pub fn replace_fields(&mut self, fields: Fields, device: &str, timestamp: Timestamp) {
        self.fields = fields;
        self.touch(device, timestamp);
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, device: &str, timestamp: Timestamp) {
        self.deleted = true;
        self.touch(device, timestamp);
    }

    /// Flag this copy as adopted from a remote replica.
    pub fn into_received(mut self) -> Self {
        self.sync = SyncState::received();
        self
    }

    fn touch(&mut self, device: &str, timestamp: Timestamp) {
        self.clock = self.clock.increment(device);
        self.last_modified_by = device.to_string();
        self.revision = self.revision.saturating_add(1);
        self.updated_at = timestamp;
        self.sync = SyncState::local_change();
    }

    /// Payload and tombstone flag match.
    pub fn same_content(&self, other: &Record) -> bool {
        self.deleted == other.deleted && self.fields == other.fields
    }

    /// Value of the completion field, `false` when absent.
    pub fn is_completed(&self) -> bool {
        self.fields
            .get(COMPLETED_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// True when the only payload difference is the completion field.
    pub fn differs_only_in_completion(&self, other: &Record) -> bool {
        if self.deleted != other.deleted || self.is_completed() == other.is_completed() {
            return false;
        }
        let strip = |fields: &Fields| {
            let mut fields = fields.clone();
            fields.remove(COMPLETED_FIELD);
            fields
        };
        strip(&self.fields) == strip(&other.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_record() {
        let record = Record::new("todo-1", fields(json!({"title": "Milk"})), "dev-a", 1000);

        assert_eq!(record.id, "todo-1");
        assert_eq!(record.revision, 1);
        assert_eq!(record.clock, VectorClock::for_device("dev-a"));
        assert_eq!(record.last_modified_by, "dev-a");
        assert!(record.is_active());
        assert!(record.sync.dirty);
        assert!(!record.sync.acknowledged);
    }

    #[test]
    fn edit_merges_fields_and_bumps_clock() {
        let mut record = Record::new(
            "todo-1",
            fields(json!({"title": "Milk", "completed": false})),
            "dev-a",
            1000,
        );
        record.sync = SyncState::received();

        record.edit("dev-b", fields(json!({"completed": true})), 2000);

        assert_eq!(record.fields["title"], json!("Milk"));
        assert_eq!(record.fields["completed"], json!(true));
        assert_eq!(record.revision, 2);
        assert_eq!(record.clock.clock_for("dev-a"), 1);
        assert_eq!(record.clock.clock_for("dev-b"), 1);
        assert_eq!(record.last_modified_by, "dev-b");
        assert_eq!(record.updated_at, 2000);
        assert_eq!(record.sync, SyncState::local_change());
    }

    #[test]
    fn delete_record() {
        let mut record = Record::new("todo-1", fields(json!({"title": "Milk"})), "dev-a", 1000);
        record.mark_deleted("dev-a", 2000);

        assert!(record.deleted);
        assert!(!record.is_active());
        assert_eq!(record.revision, 2);
        assert_eq!(record.clock.clock_for("dev-a"), 2);
    }

    #[test]
    fn version_id_combines_device_and_revision() {
        let mut record = Record::new("todo-1", Fields::new(), "dev-a", 1000);
        record.edit("dev-a", Fields::new(), 1001);
        assert_eq!(record.version_id(), "dev-a@2");
    }

    #[test]
    fn completion_only_difference() {
        let open = Record::new(
            "t",
            fields(json!({"title": "Milk", "completed": false})),
            "a",
            1,
        );
        let mut done = open.clone();
        done.fields.insert(COMPLETED_FIELD.into(), json!(true));
        assert!(open.differs_only_in_completion(&done));

        let mut renamed = done.clone();
        renamed.fields.insert("title".into(), json!("Oat milk"));
        assert!(!open.differs_only_in_completion(&renamed));
        assert!(!open.differs_only_in_completion(&open));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut record = Record::new(
            "todo-1",
            fields(json!({"title": "Milk", "priority": 3})),
            "dev-a",
            1000,
        );
        record.mark_deleted("dev-b", 2000);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("lastModifiedBy"));
        let parsed: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(record, parsed);
    }
}
