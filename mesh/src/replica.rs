//! The local replica: repository plus conflict resolver.
//!
//! All writes to the authoritative store pass through here. Remote records
//! are resolved against the stored copy and written with compare-and-swap;
//! when another writer got there first the record is re-read and resolved
//! again, so the loser sees the winner's clock as input instead of
//! overwriting it.

use std::sync::Arc;

use tandem_engine::{
    AutoRule, Conflict, ConflictResolver, ConflictUpdate, Error as EngineError, Fields, Record,
    RecordId, Resolution, ResolutionChoice, Timestamp, VectorClock,
};
use tokio::sync::broadcast;

use crate::error::{MeshError, Result};
use crate::protocol::PeerId;
use crate::repository::Repository;

/// Attempts before a record keeps losing compare-and-swap races.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Where a change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(PeerId),
}

/// Push notification for repository-layer observers.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A record was written
    Record { record: Record, origin: ChangeOrigin },
    /// A conflict was opened or gained a version
    ConflictOpened(Conflict),
    /// A conflict was settled; `record` is the new authoritative value
    ConflictResolved { record: Record, origin: ChangeOrigin },
}

/// What applying one remote record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Already known
    Unchanged,
    /// Remote was newer and replaced the local copy
    Adopted,
    /// Concurrent but identical; clocks merged
    Merged,
    /// Concurrent, settled by an automatic rule
    AutoResolved(AutoRule),
    /// Local is newer; the sender should get our copy
    KeptLocal,
    /// New conflict left for manual resolution
    ConflictOpened,
    /// Another concurrent version joined an open conflict
    ConflictExtended,
    /// Opened and immediately settled by the merge strategy
    PolicyResolved,
    /// Dominated every version of an open conflict and closed it
    ConflictSuperseded,
}

impl ApplyOutcome {
    /// The local value changed.
    pub fn is_applied(self) -> bool {
        matches!(
            self,
            ApplyOutcome::Adopted
                | ApplyOutcome::Merged
                | ApplyOutcome::AutoResolved(_)
                | ApplyOutcome::PolicyResolved
                | ApplyOutcome::ConflictSuperseded
        )
    }

    /// An unresolved conflict now exists for the record.
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            ApplyOutcome::ConflictOpened | ApplyOutcome::ConflictExtended
        )
    }
}

/// One device's replica.
pub struct Replica {
    repo: Arc<dyn Repository>,
    resolver: ConflictResolver,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Replica {
    pub fn new(repo: Arc<dyn Repository>, resolver: ConflictResolver) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            repo,
            resolver,
            changes,
        }
    }

    pub fn device_id(&self) -> &str {
        self.resolver.device_id()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn notify(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Create the record, or merge `fields` into it if it already exists.
    pub async fn put(&self, id: &str, fields: Fields, now: Timestamp) -> Result<Record> {
        let record = match self.repo.get(id).await? {
            Some(existing) if existing.is_active() => self.repo.edit(id, fields, now).await?,
            Some(_) => return Err(EngineError::RecordNotFound(id.to_string()).into()),
            None => self.repo.create(id.to_string(), fields, now).await?,
        };
        tracing::debug!(record_id = %id, clock = %record.clock, "Local write");
        self.notify(ChangeEvent::Record {
            record: record.clone(),
            origin: ChangeOrigin::Local,
        });
        Ok(record)
    }

    /// Tombstone a record.
    pub async fn delete(&self, id: &str, now: Timestamp) -> Result<Record> {
        let before = self.repo.get(id).await?;
        let record = self.repo.soft_delete(id, now).await?;
        if before.map(|r| r.is_active()).unwrap_or(false) {
            tracing::debug!(record_id = %id, clock = %record.clock, "Local delete");
            self.notify(ChangeEvent::Record {
                record: record.clone(),
                origin: ChangeOrigin::Local,
            });
        }
        Ok(record)
    }

    /// Settle an open conflict by hand.
    ///
    /// A record written in between is picked up on the next attempt; if it
    /// superseded the conflict, this fails with `ConflictNotFound`.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        choice: ResolutionChoice,
        now: Timestamp,
    ) -> Result<Record> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.try_resolve(id, choice.clone(), now).await {
                Err(MeshError::Engine(EngineError::ClockConflict(_))) => {
                    tracing::debug!(record_id = %id, attempt, "Lost write race, resolving again");
                }
                other => return other,
            }
        }
        Err(EngineError::ClockConflict(id.to_string()).into())
    }

    async fn try_resolve(&self, id: &str, choice: ResolutionChoice, now: Timestamp) -> Result<Record> {
        let expected = self.repo.get(id).await?.map(|r| r.clock);
        let conflict = self
            .repo
            .conflict(id)
            .await?
            .ok_or_else(|| EngineError::ConflictNotFound(id.to_string()))?;
        let (record, resolved) = self.resolver.resolve_conflict(&conflict, choice, now)?;
        self.write_resolution(record, resolved, expected, ChangeOrigin::Local)
            .await
    }

    async fn write_resolution(
        &self,
        record: Record,
        resolved: Conflict,
        expected: Option<VectorClock>,
        origin: ChangeOrigin,
    ) -> Result<Record> {
        self.repo.compare_and_swap(record.clone(), expected).await?;
        self.repo.upsert_conflict(resolved).await?;
        tracing::info!(record_id = %record.id, clock = %record.clock, "Conflict resolved");
        self.notify(ChangeEvent::ConflictResolved {
            record: record.clone(),
            origin,
        });
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Remote records
    // ------------------------------------------------------------------

    /// Resolve a record received from `from` against the local copy and
    /// persist the outcome.
    pub async fn apply_remote(
        &self,
        remote: &Record,
        from: &str,
        now: Timestamp,
    ) -> Result<ApplyOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.try_apply(remote, from, now).await {
                Err(MeshError::Engine(EngineError::ClockConflict(_))) => {
                    tracing::debug!(record_id = %remote.id, attempt, "Lost write race, re-resolving");
                }
                other => return other,
            }
        }
        Err(EngineError::ClockConflict(remote.id.clone()).into())
    }

    async fn try_apply(&self, remote: &Record, from: &str, now: Timestamp) -> Result<ApplyOutcome> {
        let local = self.repo.get(&remote.id).await?;
        let expected = local.as_ref().map(|r| r.clock.clone());

        let open = self
            .repo
            .conflict(&remote.id)
            .await?
            .filter(|c| !c.is_resolved());
        if let Some(conflict) = open {
            return match self.resolver.absorb(&conflict, remote) {
                ConflictUpdate::Superseded(record) => {
                    self.repo.compare_and_swap(record.clone(), expected).await?;
                    self.repo.delete_conflict(&conflict.id).await?;
                    self.notify(ChangeEvent::ConflictResolved {
                        record,
                        origin: ChangeOrigin::Remote(from.to_string()),
                    });
                    Ok(ApplyOutcome::ConflictSuperseded)
                }
                ConflictUpdate::Extended(extended) => {
                    self.open_conflict(extended, expected, now).await
                        .map(|outcome| match outcome {
                            ApplyOutcome::ConflictOpened => ApplyOutcome::ConflictExtended,
                            other => other,
                        })
                }
                ConflictUpdate::Known => Ok(ApplyOutcome::Unchanged),
            };
        }

        let outcome = match self.resolver.resolve(local.as_ref(), remote, now) {
            Resolution::Unchanged => return Ok(ApplyOutcome::Unchanged),
            Resolution::KeepLocal => return Ok(ApplyOutcome::KeptLocal),
            Resolution::Conflict(conflict) => {
                return self.open_conflict(conflict, expected, now).await
            }
            Resolution::AdoptRemote(record) => (record, ApplyOutcome::Adopted),
            Resolution::Identical(record) => (record, ApplyOutcome::Merged),
            Resolution::AutoResolved { record, rule } => {
                tracing::info!(record_id = %record.id, ?rule, "Concurrent edit auto-resolved");
                (record, ApplyOutcome::AutoResolved(rule))
            }
        };

        let (record, outcome) = outcome;
        self.repo.compare_and_swap(record.clone(), expected).await?;
        self.notify(ChangeEvent::Record {
            record,
            origin: ChangeOrigin::Remote(from.to_string()),
        });
        Ok(outcome)
    }

    /// Persist a conflict, settling it at once unless the strategy is manual.
    async fn open_conflict(
        &self,
        conflict: Conflict,
        expected: Option<VectorClock>,
        now: Timestamp,
    ) -> Result<ApplyOutcome> {
        if let Some(settled) = self.resolver.apply_policy(&conflict, now) {
            let (record, resolved) = settled?;
            self.write_resolution(record, resolved, expected, ChangeOrigin::Local)
                .await?;
            return Ok(ApplyOutcome::PolicyResolved);
        }
        tracing::info!(
            record_id = %conflict.id,
            versions = conflict.versions.len(),
            kind = ?conflict.kind,
            "Conflict left for manual resolution"
        );
        self.repo.upsert_conflict(conflict.clone()).await?;
        self.notify(ChangeEvent::ConflictOpened(conflict));
        Ok(ApplyOutcome::ConflictOpened)
    }

    /// Records to hand to a peer that does not have them, sorted by id.
    pub async fn records(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.repo.get(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use serde_json::json;
    use tandem_engine::{MergeStrategy, VectorClock};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn replica(device: &str, strategy: MergeStrategy) -> Replica {
        Replica::new(
            Arc::new(MemoryRepository::new(device)),
            ConflictResolver::new(device, strategy),
        )
    }

    #[tokio::test]
    async fn adopt_then_redeliver() {
        let laptop = replica("laptop", MergeStrategy::Manual);
        let remote = Record::new("todo-1", fields(json!({"title": "Milk"})), "phone", 1000);

        assert_eq!(
            laptop.apply_remote(&remote, "phone", 1100).await.unwrap(),
            ApplyOutcome::Adopted
        );
        assert_eq!(
            laptop.apply_remote(&remote, "phone", 1200).await.unwrap(),
            ApplyOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn conflict_lifecycle() {
        let phone = replica("phone", MergeStrategy::Manual);
        let mut events = phone.subscribe();

        let base = phone.put("todo-1", fields(json!({"title": "Milk"})), 1000).await.unwrap();
        phone.put("todo-1", fields(json!({"title": "Oat milk"})), 2000).await.unwrap();

        let mut remote = base.clone();
        remote.edit("laptop", fields(json!({"title": "Soy milk"})), 2100);
        assert_eq!(
            phone.apply_remote(&remote, "laptop", 3000).await.unwrap(),
            ApplyOutcome::ConflictOpened
        );
        // Same version again adds nothing
        assert_eq!(
            phone.apply_remote(&remote, "laptop", 3001).await.unwrap(),
            ApplyOutcome::Unchanged
        );

        let resolved = phone
            .resolve_conflict("todo-1", ResolutionChoice::Version("laptop@2".into()), 4000)
            .await
            .unwrap();
        assert_eq!(resolved.fields["title"], json!("Soy milk"));
        assert_eq!(
            resolved.clock,
            VectorClock::from_counters([("phone".to_string(), 3), ("laptop".to_string(), 1)])
        );
        assert!(phone.repository().conflicts().await.unwrap().is_empty());

        let mut saw_opened = false;
        let mut saw_resolved = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ChangeEvent::ConflictOpened(_) => saw_opened = true,
                ChangeEvent::ConflictResolved { origin, .. } => {
                    assert_eq!(origin, ChangeOrigin::Local);
                    saw_resolved = true;
                }
                ChangeEvent::Record { .. } => {}
            }
        }
        assert!(saw_opened && saw_resolved);
    }

    #[tokio::test]
    async fn remote_resolution_supersedes_conflict() {
        let phone = replica("phone", MergeStrategy::Manual);
        let laptop = replica("laptop", MergeStrategy::Manual);

        let base = phone.put("todo-1", fields(json!({"title": "Milk"})), 1000).await.unwrap();
        laptop.apply_remote(&base, "phone", 1000).await.unwrap();
        let from_phone = phone.put("todo-1", fields(json!({"title": "Oat"})), 2000).await.unwrap();
        let from_laptop = laptop.put("todo-1", fields(json!({"title": "Soy"})), 2000).await.unwrap();

        assert!(phone.apply_remote(&from_laptop, "laptop", 3000).await.unwrap().is_conflict());
        assert!(laptop.apply_remote(&from_phone, "phone", 3000).await.unwrap().is_conflict());

        let resolved = laptop
            .resolve_conflict(
                "todo-1",
                ResolutionChoice::Merged(fields(json!({"title": "Oat and soy"}))),
                4000,
            )
            .await
            .unwrap();
        assert_eq!(
            phone.apply_remote(&resolved, "laptop", 5000).await.unwrap(),
            ApplyOutcome::ConflictSuperseded
        );
        let stored = phone.repository().get("todo-1").await.unwrap().unwrap();
        assert_eq!(stored.fields["title"], json!("Oat and soy"));
        assert!(phone.repository().conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn policy_settles_immediately() {
        let phone = replica("phone", MergeStrategy::DeviceOrder);
        let base = phone.put("todo-1", fields(json!({"title": "Milk"})), 1000).await.unwrap();
        phone.put("todo-1", fields(json!({"title": "Oat"})), 2000).await.unwrap();
        let mut remote = base;
        remote.edit("tablet", fields(json!({"title": "Soy"})), 2000);

        assert_eq!(
            phone.apply_remote(&remote, "tablet", 3000).await.unwrap(),
            ApplyOutcome::PolicyResolved
        );
        // "tablet" sorts after "phone"
        let stored = phone.repository().get("todo-1").await.unwrap().unwrap();
        assert_eq!(stored.fields["title"], json!("Soy"));
    }

    #[tokio::test]
    async fn concurrent_appliers_converge() {
        let laptop = Arc::new(replica("laptop", MergeStrategy::Manual));
        let base = Record::new("todo-1", fields(json!({"title": "Milk", "completed": false})), "phone", 1000);
        laptop.apply_remote(&base, "phone", 1000).await.unwrap();

        let mut done = base.clone();
        done.edit("phone", fields(json!({"completed": true})), 2000);
        let mut gone = base.clone();
        gone.mark_deleted("tablet", 2000);

        let a = {
            let laptop = Arc::clone(&laptop);
            let done = done.clone();
            tokio::spawn(async move { laptop.apply_remote(&done, "phone", 3000).await })
        };
        let b = {
            let laptop = Arc::clone(&laptop);
            let gone = gone.clone();
            tokio::spawn(async move { laptop.apply_remote(&gone, "tablet", 3000).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = laptop.repository().get("todo-1").await.unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.clock, done.clock.merge(&gone.clock));
    }

    /// Repository that lets a rival write land just before the next
    /// compare-and-swap, as a concurrent sync cycle would.
    struct RacingRepository {
        inner: MemoryRepository,
        rival: std::sync::Mutex<Option<Record>>,
    }

    #[async_trait::async_trait]
    impl Repository for RacingRepository {
        async fn get(&self, id: &str) -> Result<Option<Record>> {
            self.inner.get(id).await
        }
        async fn upsert(&self, record: Record) -> Result<()> {
            self.inner.upsert(record).await
        }
        async fn compare_and_swap(&self, record: Record, expected: Option<VectorClock>) -> Result<()> {
            let rival = self.rival.lock().unwrap().take();
            if let Some(rival) = rival {
                let id = rival.id.clone();
                self.inner.upsert(rival).await?;
                self.inner.delete_conflict(&id).await?;
            }
            self.inner.compare_and_swap(record, expected).await
        }
        async fn create(&self, id: RecordId, fields: Fields, now: Timestamp) -> Result<Record> {
            self.inner.create(id, fields, now).await
        }
        async fn edit(&self, id: &str, fields: Fields, now: Timestamp) -> Result<Record> {
            self.inner.edit(id, fields, now).await
        }
        async fn soft_delete(&self, id: &str, now: Timestamp) -> Result<Record> {
            self.inner.soft_delete(id, now).await
        }
        async fn all(&self) -> Result<Vec<Record>> {
            self.inner.all().await
        }
        async fn dirty_records(&self) -> Result<Vec<Record>> {
            self.inner.dirty_records().await
        }
        async fn mark_acknowledged(&self, acked: Vec<(RecordId, VectorClock)>) -> Result<usize> {
            self.inner.mark_acknowledged(acked).await
        }
        async fn conflicts(&self) -> Result<Vec<Conflict>> {
            self.inner.conflicts().await
        }
        async fn conflict(&self, id: &str) -> Result<Option<Conflict>> {
            self.inner.conflict(id).await
        }
        async fn upsert_conflict(&self, conflict: Conflict) -> Result<()> {
            self.inner.upsert_conflict(conflict).await
        }
        async fn delete_conflict(&self, id: &str) -> Result<Conflict> {
            self.inner.delete_conflict(id).await
        }
        async fn snapshot(&self) -> Result<tandem_engine::StoreSnapshot> {
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn resolution_does_not_overwrite_racing_write() {
        let repo = Arc::new(RacingRepository {
            inner: MemoryRepository::new("phone"),
            rival: std::sync::Mutex::new(None),
        });
        let phone = Replica::new(
            repo.clone(),
            ConflictResolver::new("phone", MergeStrategy::Manual),
        );

        let base = phone.put("todo-1", fields(json!({"title": "Milk"})), 1000).await.unwrap();
        let local = phone.put("todo-1", fields(json!({"title": "Oat milk"})), 2000).await.unwrap();
        let mut remote = base.clone();
        remote.edit("laptop", fields(json!({"title": "Soy milk"})), 2100);
        assert!(phone.apply_remote(&remote, "laptop", 3000).await.unwrap().is_conflict());

        // Another replica's resolution arrives while we resolve by hand
        let mut rival = local.clone();
        rival.fields = fields(json!({"title": "Almond milk"}));
        rival.clock = local.clock.merge(&remote.clock).increment("tablet");
        rival.last_modified_by = "tablet".into();
        rival.revision = 3;
        *repo.rival.lock().unwrap() = Some(rival.clone());

        let err = phone
            .resolve_conflict("todo-1", ResolutionChoice::Version("laptop@2".into()), 4000)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let stored = phone.repository().get("todo-1").await.unwrap().unwrap();
        assert_eq!(stored.fields["title"], json!("Almond milk"));
        assert_eq!(stored.clock, rival.clock);
    }

    #[tokio::test]
    async fn deleting_tombstone_is_silent() {
        let phone = replica("phone", MergeStrategy::Manual);
        phone.put("todo-1", fields(json!({"title": "Milk"})), 1000).await.unwrap();
        phone.delete("todo-1", 2000).await.unwrap();

        let mut events = phone.subscribe();
        phone.delete("todo-1", 3000).await.unwrap();
        assert!(events.try_recv().is_err());

        let err = phone.put("todo-1", Fields::new(), 4000).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
