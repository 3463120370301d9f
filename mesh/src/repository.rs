//! The local store collaborator.
//!
//! Every call is keyed by record or conflict id and idempotent on repeated
//! identical input. Replicated writes go through
//! [`Repository::compare_and_swap`] so concurrent sync cycles touching the
//! same record never overwrite each other blindly.

use async_trait::async_trait;
use tandem_engine::{
    Conflict, Fields, Record, RecordId, ReplicaStore, StoreSnapshot, Timestamp, VectorClock,
};
use tokio::sync::RwLock;

use crate::error::Result;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Get a record by id, tombstones included.
    async fn get(&self, id: &str) -> Result<Option<Record>>;

    /// Insert or replace a record.
    async fn upsert(&self, record: Record) -> Result<()>;

    /// Replace a record only if its stored clock still equals `expected`.
    async fn compare_and_swap(&self, record: Record, expected: Option<VectorClock>) -> Result<()>;

    /// Create a record authored by this device.
    async fn create(&self, id: RecordId, fields: Fields, now: Timestamp) -> Result<Record>;

    /// Merge fields into an active record, as this device.
    async fn edit(&self, id: &str, fields: Fields, now: Timestamp) -> Result<Record>;

    /// Tombstone a record, as this device.
    async fn soft_delete(&self, id: &str, now: Timestamp) -> Result<Record>;

    /// Every record, tombstones included, sorted by id.
    async fn all(&self) -> Result<Vec<Record>>;

    /// Records with changes no remote replica has acknowledged.
    async fn dirty_records(&self) -> Result<Vec<Record>>;

    /// Mark records acknowledged at the given clocks.
    async fn mark_acknowledged(&self, acked: Vec<(RecordId, VectorClock)>) -> Result<usize>;

    /// Unresolved conflicts.
    async fn conflicts(&self) -> Result<Vec<Conflict>>;

    /// A conflict by record id, resolved or not.
    async fn conflict(&self, id: &str) -> Result<Option<Conflict>>;

    async fn upsert_conflict(&self, conflict: Conflict) -> Result<()>;

    async fn delete_conflict(&self, id: &str) -> Result<Conflict>;

    /// Full state for persistence.
    async fn snapshot(&self) -> Result<StoreSnapshot>;
}

/// Repository backed by an in-memory [`ReplicaStore`].
pub struct MemoryRepository {
    store: RwLock<ReplicaStore>,
}

impl MemoryRepository {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            store: RwLock::new(ReplicaStore::new(device_id)),
        }
    }

    /// Restore from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        Ok(Self {
            store: RwLock::new(ReplicaStore::import_snapshot(snapshot)?),
        })
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.store.read().await.get(id).cloned())
    }

    async fn upsert(&self, record: Record) -> Result<()> {
        self.store.write().await.upsert(record);
        Ok(())
    }

    async fn compare_and_swap(&self, record: Record, expected: Option<VectorClock>) -> Result<()> {
        Ok(self
            .store
            .write()
            .await
            .compare_and_swap(record, expected.as_ref())?)
    }

    async fn create(&self, id: RecordId, fields: Fields, now: Timestamp) -> Result<Record> {
        Ok(self.store.write().await.create(id, fields, now)?)
    }

    async fn edit(&self, id: &str, fields: Fields, now: Timestamp) -> Result<Record> {
        Ok(self.store.write().await.edit(id, fields, now)?)
    }

    async fn soft_delete(&self, id: &str, now: Timestamp) -> Result<Record> {
        Ok(self.store.write().await.delete(id, now)?)
    }

    async fn all(&self) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self.store.read().await.all().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn dirty_records(&self) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self.store.read().await.dirty_records().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn mark_acknowledged(&self, acked: Vec<(RecordId, VectorClock)>) -> Result<usize> {
        Ok(self.store.write().await.mark_acknowledged(&acked))
    }

    async fn conflicts(&self) -> Result<Vec<Conflict>> {
        let mut conflicts: Vec<Conflict> = self.store.read().await.conflicts().cloned().collect();
        conflicts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(conflicts)
    }

    async fn conflict(&self, id: &str) -> Result<Option<Conflict>> {
        Ok(self.store.read().await.conflict(id).cloned())
    }

    async fn upsert_conflict(&self, conflict: Conflict) -> Result<()> {
        self.store.write().await.upsert_conflict(conflict);
        Ok(())
    }

    async fn delete_conflict(&self, id: &str) -> Result<Conflict> {
        Ok(self.store.write().await.delete_conflict(id)?)
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.store.read().await.export_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let repo = MemoryRepository::new("phone");
        let created = repo
            .create("todo-1".into(), fields(json!({"title": "Milk"})), 1000)
            .await
            .unwrap();
        assert_eq!(repo.get("todo-1").await.unwrap(), Some(created));

        repo.edit("todo-1", fields(json!({"title": "Oat milk"})), 2000)
            .await
            .unwrap();
        let deleted = repo.soft_delete("todo-1", 3000).await.unwrap();
        assert!(deleted.deleted);
        // Idempotent on repeat
        assert_eq!(repo.soft_delete("todo-1", 4000).await.unwrap(), deleted);
        assert_eq!(repo.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_detects_races() {
        let repo = MemoryRepository::new("phone");
        let record = repo
            .create("todo-1".into(), fields(json!({"title": "Milk"})), 1000)
            .await
            .unwrap();

        let mut first = record.clone();
        first.edit("laptop", fields(json!({"title": "A"})), 2000);
        let mut second = record.clone();
        second.edit("tablet", fields(json!({"title": "B"})), 2000);

        repo.compare_and_swap(first, Some(record.clock.clone()))
            .await
            .unwrap();
        let err = repo
            .compare_and_swap(second, Some(record.clock.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Engine(tandem_engine::Error::ClockConflict(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_restores() {
        let repo = MemoryRepository::new("phone");
        repo.create("todo-1".into(), fields(json!({"title": "Milk"})), 1000)
            .await
            .unwrap();

        let restored = MemoryRepository::from_snapshot(repo.snapshot().await.unwrap()).unwrap();
        assert_eq!(
            restored.all().await.unwrap(),
            repo.all().await.unwrap()
        );
    }
}
