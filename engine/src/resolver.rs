//! Conflict detection and resolution between two record histories.
//!
//! This is the core of convergence. Given the local copy of a record and an
//! incoming remote copy, the resolver decides what the authoritative value
//! becomes.
//!
//! # Algorithm
//!
//! 1. Compare the two vector clocks
//! 2. `Before`: the remote copy is newer, adopt it
//! 3. `After`: the local copy is newer, keep it (and tell the peer)
//! 4. `Concurrent`:
//!    - identical content: merge the clocks, nothing else changes
//!    - delete vs. modify: the delete wins
//!    - only the completion flag differs: the completed copy wins
//!    - otherwise: open a [`Conflict`] for a human or a [`MergeStrategy`]
//!
//! Automatic outcomes take the merged clock of both inputs without adding a
//! new event, so two replicas resolving the same pair independently land on
//! the identical record. Manual resolutions add an event for the resolving
//! device so the chosen value dominates every conflicting version.

use crate::{
    error::Result, CausalOrder, Conflict, DeviceId, Error, Fields, Record, Timestamp,
    VectorClock,
};
use serde::{Deserialize, Serialize};

/// Policy applied to conflicts that the automatic rules leave open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Leave the conflict for a human (default)
    #[default]
    Manual,
    /// Latest `updated_at` wins, ties broken by device id
    LatestWins,
    /// Lexicographically highest device id wins, ties broken by revision
    DeviceOrder,
}

impl std::str::FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(MergeStrategy::Manual),
            "latest_wins" => Ok(MergeStrategy::LatestWins),
            "device_order" => Ok(MergeStrategy::DeviceOrder),
            other => Err(Error::InvalidPayload(format!(
                "unknown merge strategy: {other}"
            ))),
        }
    }
}

/// Which automatic rule settled a concurrent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoRule {
    DeleteWins,
    PreferCompleted,
}

/// Decision for one incoming record.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Already known: equal clocks and equal content
    Unchanged,
    /// Remote is causally newer; store it
    AdoptRemote(Record),
    /// Local is causally newer; the peer should receive the local copy
    KeepLocal,
    /// Concurrent but identical content; store the local copy with merged clock
    Identical(Record),
    /// Concurrent, settled by an automatic rule
    AutoResolved { record: Record, rule: AutoRule },
    /// Concurrent and genuinely different
    Conflict(Conflict),
}

/// Effect of an incoming record on an open conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictUpdate {
    /// The record causally covers every version; it replaces the conflict
    Superseded(Record),
    /// The record is a further concurrent version
    Extended(Conflict),
    /// The record adds nothing
    Known,
}

/// How a human (or policy) settles a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionChoice {
    /// Keep one of the retained versions
    Version(String),
    /// Use a hand-merged payload
    Merged(Fields),
}

/// Stateless resolver bound to the local device.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    device_id: DeviceId,
    strategy: MergeStrategy,
}

impl ConflictResolver {
    /// Create a resolver acting on behalf of `device_id`.
    pub fn new(device_id: impl Into<DeviceId>, strategy: MergeStrategy) -> Self {
        Self {
            device_id: device_id.into(),
            strategy,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Decide what happens when `remote` arrives for a record held locally
    /// as `local` (or not held at all).
    pub fn resolve(&self, local: Option<&Record>, remote: &Record, now: Timestamp) -> Resolution {
        let Some(local) = local else {
            return Resolution::AdoptRemote(remote.clone().into_received());
        };

        if local.clock == remote.clock && local.same_content(remote) {
            return Resolution::Unchanged;
        }

        match local.clock.compare(&remote.clock) {
            CausalOrder::Before => Resolution::AdoptRemote(remote.clone().into_received()),
            CausalOrder::After => Resolution::KeepLocal,
            CausalOrder::Concurrent => self.resolve_concurrent(local, remote, now),
        }
    }

    fn resolve_concurrent(&self, local: &Record, remote: &Record, now: Timestamp) -> Resolution {
        let merged = local.clock.merge(&remote.clock);

        if local.same_content(remote) {
            let mut record = local.clone();
            record.clock = merged;
            return Resolution::Identical(record);
        }

        if local.deleted || remote.deleted {
            let winner = match (local.deleted, remote.deleted) {
                (true, false) => local,
                (false, true) => remote,
                _ => latest_tombstone(local, remote),
            };
            return Resolution::AutoResolved {
                record: settle(winner, local, remote, merged),
                rule: AutoRule::DeleteWins,
            };
        }

        if local.differs_only_in_completion(remote) {
            let winner = if local.is_completed() { local } else { remote };
            return Resolution::AutoResolved {
                record: settle(winner, local, remote, merged),
                rule: AutoRule::PreferCompleted,
            };
        }

        Resolution::Conflict(Conflict::new(local.clone(), remote.clone(), now))
    }

    /// Fold a record arriving for an id that already has an open conflict.
    pub fn absorb(&self, conflict: &Conflict, remote: &Record) -> ConflictUpdate {
        if conflict.is_superseded_by(&remote.clock) {
            return ConflictUpdate::Superseded(remote.clone().into_received());
        }
        let mut extended = conflict.clone();
        if extended.add_version(remote.clone()) {
            ConflictUpdate::Extended(extended)
        } else {
            ConflictUpdate::Known
        }
    }

    /// Settle `conflict` with `choice`.
    ///
    /// Returns the new authoritative record and the conflict marked resolved.
    /// The record's clock covers every version plus one event for this device.
    pub fn resolve_conflict(
        &self,
        conflict: &Conflict,
        choice: ResolutionChoice,
        now: Timestamp,
    ) -> Result<(Record, Conflict)> {
        if conflict.is_resolved() {
            return Err(Error::ConflictAlreadyResolved(conflict.id.clone()));
        }
        let first = conflict
            .versions
            .first()
            .ok_or_else(|| Error::ConflictNotFound(conflict.id.clone()))?;

        let mut record = match choice {
            ResolutionChoice::Version(version_id) => conflict
                .version(&version_id)
                .cloned()
                .ok_or_else(|| Error::VersionNotFound {
                    conflict: conflict.id.clone(),
                    version: version_id,
                })?,
            ResolutionChoice::Merged(fields) => {
                let mut record = first.clone();
                record.fields = fields;
                record.deleted = false;
                record
            }
        };

        let revision = conflict.versions.iter().map(|v| v.revision).max().unwrap_or(0);
        record.clock = conflict.merged_clock().increment(self.device_id.clone());
        record.last_modified_by = self.device_id.clone();
        record.revision = revision.saturating_add(1);
        record.updated_at = now;
        record.sync = crate::SyncState::local_change();

        let mut resolved = conflict.clone();
        resolved.mark_resolved(&self.device_id, now);
        Ok((record, resolved))
    }

    /// The choice the configured strategy would make, `None` under
    /// [`MergeStrategy::Manual`].
    pub fn policy_choice(&self, conflict: &Conflict) -> Option<ResolutionChoice> {
        let winner = match self.strategy {
            MergeStrategy::Manual => return None,
            MergeStrategy::LatestWins => conflict.versions.iter().max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.last_modified_by.cmp(&b.last_modified_by))
            }),
            MergeStrategy::DeviceOrder => conflict.versions.iter().max_by(|a, b| {
                a.last_modified_by
                    .cmp(&b.last_modified_by)
                    .then_with(|| a.revision.cmp(&b.revision))
            }),
        }?;
        Some(ResolutionChoice::Version(conflict.version_id_of(winner)))
    }

    /// Settle `conflict` with the configured strategy, if it is not manual.
    pub fn apply_policy(
        &self,
        conflict: &Conflict,
        now: Timestamp,
    ) -> Option<Result<(Record, Conflict)>> {
        self.policy_choice(conflict)
            .map(|choice| self.resolve_conflict(conflict, choice, now))
    }
}

/// Deterministic pick between two tombstones, independent of argument order.
fn latest_tombstone<'a>(a: &'a Record, b: &'a Record) -> &'a Record {
    let key = |r: &Record| (r.updated_at, r.last_modified_by.clone(), r.revision);
    if key(a) >= key(b) {
        a
    } else {
        b
    }
}

/// Build the automatically chosen record: winner's content, merged clock.
fn settle(winner: &Record, local: &Record, remote: &Record, clock: VectorClock) -> Record {
    let mut record = winner.clone();
    record.clock = clock;
    record.revision = local.revision.max(remote.revision).saturating_add(1);
    record.updated_at = local.updated_at.max(remote.updated_at);
    record.sync = crate::SyncState::local_change();
    record
}
