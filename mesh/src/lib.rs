//! # Tandem Mesh
//!
//! Peer-to-peer replication node built on [`tandem_engine`].
//!
//! Nodes find each other through [`discovery`], keep one link per
//! neighbour through [`link`], and relay [`message::MeshMessage`] envelopes
//! hop by hop under the [`router::Router`]'s loop, duplicate and expiry
//! rules. The [`coordinator::MeshSyncCoordinator`] runs request/plan/batch
//! sync cycles over those links and broadcasts local edits as they happen;
//! every record received from anywhere passes through the
//! [`replica::Replica`], which resolves it against the local copy.
//!
//! A [`backend::BackendSync`] connects the same replica to a star-topology
//! remote backend, and [`routes`] exposes the whole thing over HTTP.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod link;
pub mod message;
pub mod node;
pub mod protocol;
pub mod replica;
pub mod repository;
pub mod router;
pub mod routes;

pub use backend::{BackendSync, MemoryBackend, RemoteBackend};
pub use config::{Config, DiscoveryConfig, SyncConfig};
pub use coordinator::{MeshSyncCoordinator, SyncOutcome, SyncResult, SyncSummary};
pub use discovery::{Peer, PeerDiscovery, PeerStatus};
pub use error::{LinkError, MeshError, Result};
pub use link::{MemoryNetwork, PeerLink, TcpTransport, Transport};
pub use message::MeshMessage;
pub use node::MeshNode;
pub use protocol::{Announcement, Capabilities, MeshPayload, MessageType, PeerId, RecordPayload};
pub use replica::{ApplyOutcome, ChangeEvent, ChangeOrigin, Replica};
pub use repository::{MemoryRepository, Repository};
pub use router::{DropReason, RouteDecision, Router};

use tandem_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
