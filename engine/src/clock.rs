//! Vector clock for causal ordering of record revisions.
//!
//! Each replica owns one entry. Comparing two clocks yields a partial order:
//! one clock happened before the other, after it, or the two are concurrent.
//! No wall-clock time is involved, so device clock skew cannot reorder edits.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CausalOrder {
    /// `self` happened before `other`
    Before,
    /// `self` happened after `other`
    After,
    /// Neither dominates, or the clocks are identical
    Concurrent,
}

impl CausalOrder {
    /// The order seen from the other side of the comparison.
    pub fn inverse(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            CausalOrder::Concurrent => CausalOrder::Concurrent,
        }
    }
}

/// A mapping from device to logical counter.
///
/// Absent devices count as zero. Clocks are values: every operation returns
/// a new clock and never shrinks an existing entry. Zero entries are never
/// stored, so structural equality matches logical equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that has seen exactly one event on `device`.
    pub fn for_device(device: impl Into<DeviceId>) -> Self {
        Self::new().increment(device)
    }

    /// Build a clock from explicit counters. Zero counters are dropped.
    pub fn from_counters<I, D>(counters: I) -> Self
    where
        I: IntoIterator<Item = (D, u64)>,
        D: Into<DeviceId>,
    {
        Self {
            counters: counters
                .into_iter()
                .filter(|(_, counter)| *counter > 0)
                .map(|(device, counter)| (device.into(), counter))
                .collect(),
        }
    }

    /// Counter for `device`, zero if never seen.
    pub fn clock_for(&self, device: &str) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// New clock with `device` advanced by one. A counter at `u64::MAX`
    /// stays there.
    pub fn increment(&self, device: impl Into<DeviceId>) -> Self {
        let mut counters = self.counters.clone();
        let counter = counters.entry(device.into()).or_insert(0);
        *counter = counter.saturating_add(1);
        Self { counters }
    }

    /// New clock holding the pointwise maximum of both inputs.
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut counters = self.counters.clone();
        for (device, &counter) in &other.counters {
            let entry = counters.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        Self { counters }
    }

    /// Compare against `other` over the union of both device sets.
    ///
    /// Identical clocks report [`CausalOrder::Concurrent`]; callers that care
    /// about "no new information" check equality first.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut self_behind = false;
        let mut self_ahead = false;

        for device in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.clock_for(device);
            let theirs = other.clock_for(device);
            if mine < theirs {
                self_behind = true;
            } else if mine > theirs {
                self_ahead = true;
            }
            if self_behind && self_ahead {
                return CausalOrder::Concurrent;
            }
        }

        match (self_behind, self_ahead) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            _ => CausalOrder::Concurrent,
        }
    }

    /// True when every counter of `self` is <= the matching counter of `other`.
    pub fn is_dominated_by(&self, other: &VectorClock) -> bool {
        self == other || self.compare(other) == CausalOrder::Before
    }

    /// Devices with a non-zero counter.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.counters.keys()
    }

    /// Iterate `(device, counter)` pairs in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.counters.iter().map(|(device, counter)| (device, *counter))
    }

    /// True for a clock that has seen no events.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (device, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        f.write_str("}")
    }
}
