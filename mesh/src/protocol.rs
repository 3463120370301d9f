//! Mesh message protocol definitions.
//!
//! Payloads are JSON-encoded tagged unions using snake_case type tags.
//! Every payload kind maps to one [`MessageType`], which fixes its hop
//! budget and whether delivery is retried.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tandem_engine::{Error as EngineError, Fields, Record, RecordId, Revision, SyncState, Timestamp, VectorClock};

/// Identifier of a mesh node (the same value as its device id).
pub type PeerId = String;

/// Identifier correlating the messages of one sync cycle.
pub type SessionId = String;

/// Recipient value addressing every node.
pub const BROADCAST: &str = "*";

/// Message classes carried by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    Presence,
    DiscoveryProbe,
    DiscoveryReply,
    SyncRequest,
    SyncPlan,
    RecordBatch,
    RecordUpdate,
    RecordDelete,
    ConflictResolved,
    SyncComplete,
}

impl MessageType {
    /// Data-bearing messages, eligible for retry when a send fails.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            MessageType::SyncPlan
                | MessageType::RecordBatch
                | MessageType::RecordUpdate
                | MessageType::RecordDelete
                | MessageType::ConflictResolved
        )
    }

    /// Hop budget for an addressed message of this class.
    pub fn default_ttl(self) -> u32 {
        match self {
            MessageType::Heartbeat | MessageType::Presence => 2,
            MessageType::DiscoveryProbe | MessageType::DiscoveryReply => 3,
            _ => 5,
        }
    }

    /// Stable tag, also fed into the message checksum.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Presence => "presence",
            MessageType::DiscoveryProbe => "discovery_probe",
            MessageType::DiscoveryReply => "discovery_reply",
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncPlan => "sync_plan",
            MessageType::RecordBatch => "record_batch",
            MessageType::RecordUpdate => "record_update",
            MessageType::RecordDelete => "record_delete",
            MessageType::ConflictResolved => "conflict_resolved",
            MessageType::SyncComplete => "sync_complete",
        }
    }
}

/// Capability flags announced by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Takes part in sync cycles
    pub sync: bool,
    /// Forwards messages for other nodes
    pub relay: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sync: true,
            relay: true,
        }
    }
}

/// What a node says about itself in presence and discovery traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: PeerId,
    pub name: String,
    /// Address other nodes can dial, if the node accepts connections
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Self-contained wire form of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    pub id: RecordId,
    pub fields: Fields,
    pub clock: VectorClock,
    /// Device that produced this revision
    pub origin: PeerId,
    pub revision: Revision,
    pub deleted: bool,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl RecordPayload {
    /// Rebuild a record, rejecting payloads no replica could have produced.
    pub fn into_record(self) -> Result<Record, EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidPayload("record id is empty".into()));
        }
        if self.clock.is_empty() || self.clock.clock_for(&self.origin) == 0 {
            return Err(EngineError::InvalidPayload(format!(
                "record {} carries no event from its origin {}",
                self.id, self.origin
            )));
        }
        if self.revision == 0 {
            return Err(EngineError::InvalidPayload(format!(
                "record {} has revision 0",
                self.id
            )));
        }
        if self.revision == u64::MAX || self.clock.iter().any(|(_, c)| c == u64::MAX) {
            return Err(EngineError::InvalidPayload(format!(
                "record {} has an exhausted counter",
                self.id
            )));
        }
        Ok(Record {
            id: self.id,
            fields: self.fields,
            deleted: self.deleted,
            clock: self.clock,
            last_modified_by: self.origin,
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync: SyncState::received(),
        })
    }
}

impl From<&Record> for RecordPayload {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            fields: record.fields.clone(),
            clock: record.clock.clone(),
            origin: record.last_modified_by.clone(),
            revision: record.revision,
            deleted: record.deleted,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Decoded message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshPayload {
    /// Liveness ping between neighbours.
    Heartbeat { sent_at: Timestamp },

    /// Periodic self-announcement; also the first frame on a new link.
    Presence { node: Announcement },

    /// Ask nearby nodes to announce themselves.
    DiscoveryProbe { node: Announcement },

    /// Answer to a probe.
    DiscoveryReply { node: Announcement },

    /// Open a sync cycle.
    SyncRequest {
        session_id: SessionId,
        /// Merge of every record clock held by the requester
        clock: VectorClock,
        /// Clock of every record held by the requester
        digest: BTreeMap<RecordId, VectorClock>,
    },

    /// Responder's plan for the cycle.
    SyncPlan {
        session_id: SessionId,
        /// Records the responder is about to send
        send: Vec<RecordId>,
        /// Records the responder wants from the requester
        want: Vec<RecordId>,
        clock: VectorClock,
    },

    /// Records exchanged within a cycle.
    RecordBatch {
        session_id: SessionId,
        records: Vec<RecordPayload>,
    },

    /// Live propagation of a local edit.
    RecordUpdate { record: RecordPayload },

    /// Live propagation of a local delete.
    RecordDelete { record: RecordPayload },

    /// A conflict was settled; the record dominates every conflicting version.
    ConflictResolved {
        record: RecordPayload,
        resolved_by: PeerId,
    },

    /// End of a cycle, sent by both sides.
    SyncComplete {
        session_id: SessionId,
        applied: usize,
        conflicts: usize,
    },
}

impl MeshPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MeshPayload::Heartbeat { .. } => MessageType::Heartbeat,
            MeshPayload::Presence { .. } => MessageType::Presence,
            MeshPayload::DiscoveryProbe { .. } => MessageType::DiscoveryProbe,
            MeshPayload::DiscoveryReply { .. } => MessageType::DiscoveryReply,
            MeshPayload::SyncRequest { .. } => MessageType::SyncRequest,
            MeshPayload::SyncPlan { .. } => MessageType::SyncPlan,
            MeshPayload::RecordBatch { .. } => MessageType::RecordBatch,
            MeshPayload::RecordUpdate { .. } => MessageType::RecordUpdate,
            MeshPayload::RecordDelete { .. } => MessageType::RecordDelete,
            MeshPayload::ConflictResolved { .. } => MessageType::ConflictResolved,
            MeshPayload::SyncComplete { .. } => MessageType::SyncComplete,
        }
    }

    /// Session this payload belongs to, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            MeshPayload::SyncRequest { session_id, .. }
            | MeshPayload::SyncPlan { session_id, .. }
            | MeshPayload::RecordBatch { session_id, .. }
            | MeshPayload::SyncComplete { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}
