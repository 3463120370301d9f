//! Conflict types: divergent histories kept for later resolution.

use crate::{ConflictId, DeviceId, Record, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

/// What kind of divergence a conflict represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Both sides edited the payload differently
    Content,
    /// One side deleted while the other modified
    DeleteModify,
}

impl ConflictKind {
    /// Classify a pair of concurrent versions.
    pub fn classify(a: &Record, b: &Record) -> Self {
        if a.deleted != b.deleted {
            ConflictKind::DeleteModify
        } else {
            ConflictKind::Content
        }
    }
}

/// Resolution state of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConflictState {
    Unresolved,
    #[serde(rename_all = "camelCase")]
    Resolved {
        resolved_by: DeviceId,
        resolved_at: Timestamp,
    },
}

/// Unresolved divergence for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Identifier of the conflicted record
    pub id: ConflictId,
    /// Full snapshots of every conflicting version, in arrival order
    pub versions: Vec<Record>,
    /// When the divergence was detected (milliseconds since epoch)
    pub detected_at: Timestamp,
    pub kind: ConflictKind,
    pub state: ConflictState,
}

impl Conflict {
    /// Open a conflict between the local and the incoming version.
    pub fn new(local: Record, remote: Record, detected_at: Timestamp) -> Self {
        Self {
            id: local.id.clone(),
            kind: ConflictKind::classify(&local, &remote),
            versions: vec![local, remote],
            detected_at,
            state: ConflictState::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, ConflictState::Resolved { .. })
    }

    /// Identifier of `version` within this conflict.
    ///
    /// Normally [`Record::version_id`]. An automatically settled copy keeps
    /// its winner's origin under a new revision, so two versions can share
    /// `origin@revision`; those are qualified with their clock.
    pub fn version_id_of(&self, version: &Record) -> String {
        let base = version.version_id();
        let shared = self
            .versions
            .iter()
            .filter(|v| v.version_id() == base)
            .count();
        if shared > 1 {
            format!("{base}{}", version.clock)
        } else {
            base
        }
    }

    /// Look up a version by [`Conflict::version_id_of`].
    pub fn version(&self, version_id: &str) -> Option<&Record> {
        self.versions
            .iter()
            .find(|v| self.version_id_of(v) == version_id)
    }

    /// Version identifiers in arrival order.
    pub fn version_ids(&self) -> Vec<String> {
        self.versions.iter().map(|v| self.version_id_of(v)).collect()
    }

    /// Add another concurrent version.
    ///
    /// Versions already present (same clock) are ignored, and versions
    /// dominated by a retained one are dropped. Returns whether the set changed.
    pub fn add_version(&mut self, record: Record) -> bool {
        if self
            .versions
            .iter()
            .any(|v| record.clock.is_dominated_by(&v.clock))
        {
            return false;
        }
        self.versions
            .retain(|v| !v.clock.is_dominated_by(&record.clock));
        if self.versions.iter().any(|v| v.deleted != record.deleted) {
            self.kind = ConflictKind::DeleteModify;
        }
        self.versions.push(record);
        true
    }

    /// Pointwise maximum over every version's clock.
    pub fn merged_clock(&self) -> VectorClock {
        self.versions
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.merge(&v.clock))
    }

    /// True when `clock` causally covers every retained version.
    pub fn is_superseded_by(&self, clock: &VectorClock) -> bool {
        self.versions.iter().all(|v| v.clock.is_dominated_by(clock))
    }

    pub(crate) fn mark_resolved(&mut self, device: &str, timestamp: Timestamp) {
        self.state = ConflictState::Resolved {
            resolved_by: device.to_string(),
            resolved_at: timestamp,
        };
    }
}
