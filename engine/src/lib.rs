//! # Tandem Engine
//!
//! The causal replication core for peer-to-peer, local-first applications.
//!
//! This crate decides how replicas of the same record converge. It tracks
//! causal history with vector clocks, detects concurrent edits and settles
//! them either automatically or by recording a conflict for a human.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Two replicas resolving the same pair reach the same record
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Vector Clocks
//!
//! A [`VectorClock`] maps device ids to event counters. Comparing two clocks
//! yields a [`CausalOrder`]: one happened before the other, or they are
//! concurrent. Clock operations return new values and never mutate in place.
//!
//! ### Records
//!
//! A [`Record`] is a JSON object payload plus its clock, the device that
//! produced the current revision, and a tombstone flag. Deleted records are
//! kept so the delete itself can replicate.
//!
//! ### Resolution
//!
//! The [`ConflictResolver`] compares a local and a remote copy:
//! - the causally newer copy wins outright
//! - concurrent copies with identical content merge their clocks
//! - a delete beats a concurrent modification ([`AutoRule::DeleteWins`])
//! - a completed item beats an open one ([`AutoRule::PreferCompleted`])
//! - anything else becomes a [`Conflict`], settled later with a
//!   [`ResolutionChoice`] or by a non-manual [`MergeStrategy`]
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{ConflictResolver, MergeStrategy, ReplicaStore, Resolution};
//! use serde_json::json;
//!
//! let fields = |v: serde_json::Value| v.as_object().cloned().unwrap();
//!
//! // Two devices start from the same record
//! let mut phone = ReplicaStore::new("phone");
//! let base = phone
//!     .create("todo-1", fields(json!({"title": "Milk", "completed": false})), 1000)
//!     .unwrap();
//! let mut laptop = ReplicaStore::new("laptop");
//! laptop.upsert(base.into_received());
//!
//! // Offline, each edits the title differently
//! phone.edit("todo-1", fields(json!({"title": "Oat milk"})), 2000).unwrap();
//! let remote = laptop
//!     .edit("todo-1", fields(json!({"title": "Soy milk"})), 2100)
//!     .unwrap();
//!
//! // When they meet, the phone detects a genuine conflict
//! let resolver = ConflictResolver::new("phone", MergeStrategy::Manual);
//! let outcome = resolver.resolve(phone.get("todo-1"), &remote, 3000);
//! assert!(matches!(outcome, Resolution::Conflict(_)));
//! ```
//!
//! ## Persistence
//!
//! Use [`ReplicaStore::export_snapshot`] and [`ReplicaStore::import_snapshot`]
//! with [`StoreSnapshot`] for persistence. Snapshots are serializable to JSON
//! with deterministic ordering.

pub mod clock;
pub mod conflict;
pub mod error;
pub mod record;
pub mod resolver;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{CausalOrder, VectorClock};
pub use conflict::{Conflict, ConflictKind, ConflictState};
pub use error::Error;
pub use record::{Fields, Record, SyncState, COMPLETED_FIELD};
pub use resolver::{
    AutoRule, ConflictResolver, ConflictUpdate, MergeStrategy, Resolution, ResolutionChoice,
};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::ReplicaStore;

/// Type aliases for clarity
pub type RecordId = String;
/// Conflicts are keyed by the id of the record they concern
pub type ConflictId = String;
pub type DeviceId = String;
pub type Revision = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
