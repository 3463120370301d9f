//! The mesh wire envelope.
//!
//! A [`MeshMessage`] wraps an opaque JSON payload with routing metadata. Its
//! checksum covers everything except the traversal path and the remaining
//! TTL, so forwarding does not invalidate it: verification adds the hops
//! already traversed back onto the TTL to recover the value the sender
//! signed over.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tandem_engine::Timestamp;

use crate::error::{MeshError, Result};
use crate::protocol::{MeshPayload, MessageType, PeerId, BROADCAST};

/// Messages older than this are dropped regardless of TTL.
pub const STALE_AFTER_MS: u64 = 5 * 60 * 1000;

/// Hop budget cap for broadcasts.
pub const BROADCAST_TTL: u32 = 3;

/// A routed mesh message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMessage {
    pub id: String,
    pub sender: PeerId,
    /// Target node, or [`BROADCAST`]
    pub recipient: PeerId,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    /// Creation time (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Remaining hop budget
    pub ttl: u32,
    /// Nodes traversed so far, sender first
    pub path: Vec<PeerId>,
    /// Hex SHA-256 over the routing-independent fields
    pub checksum: String,
}

impl MeshMessage {
    /// Stamp a new message with a fresh id and checksum.
    pub fn create(
        sender: impl Into<PeerId>,
        recipient: impl Into<PeerId>,
        message_type: MessageType,
        payload: serde_json::Value,
        ttl: u32,
        timestamp: Timestamp,
    ) -> Self {
        let sender = sender.into();
        let mut message = Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.into(),
            path: vec![sender.clone()],
            sender,
            message_type,
            payload,
            timestamp,
            ttl,
            checksum: String::new(),
        };
        message.checksum = message.compute_checksum(ttl);
        message
    }

    /// Message addressed to one node, with the class hop budget.
    pub fn addressed(
        sender: impl Into<PeerId>,
        recipient: impl Into<PeerId>,
        payload: &MeshPayload,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let message_type = payload.message_type();
        Ok(Self::create(
            sender,
            recipient,
            message_type,
            serde_json::to_value(payload)?,
            message_type.default_ttl(),
            timestamp,
        ))
    }

    /// Message for every node, with a budget no larger than [`BROADCAST_TTL`].
    pub fn broadcast(
        sender: impl Into<PeerId>,
        payload: &MeshPayload,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let message_type = payload.message_type();
        Ok(Self::create(
            sender,
            BROADCAST,
            message_type,
            serde_json::to_value(payload)?,
            message_type.default_ttl().min(BROADCAST_TTL),
            timestamp,
        ))
    }

    /// Decode the payload and check it matches the type tag.
    pub fn decode(&self) -> Result<MeshPayload> {
        let payload: MeshPayload = serde_json::from_value(self.payload.clone())?;
        if payload.message_type() != self.message_type {
            return Err(MeshError::Protocol(format!(
                "message {} tagged {} carries {}",
                self.id,
                self.message_type.as_str(),
                payload.message_type().as_str()
            )));
        }
        Ok(payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }

    /// Hop budget left.
    pub fn is_valid(&self) -> bool {
        self.ttl > 0
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.timestamp) > STALE_AFTER_MS
    }

    pub fn has_visited(&self, node: &str) -> bool {
        self.path.iter().any(|p| p == node)
    }

    /// Recompute the checksum with the TTL the sender started from.
    pub fn verify(&self) -> bool {
        let hops = self.path.len().saturating_sub(1) as u32;
        match self.ttl.checked_add(hops) {
            Some(original_ttl) => self.compute_checksum(original_ttl) == self.checksum,
            None => false,
        }
    }

    /// Copy of this message one hop further: `node` appended, TTL reduced.
    pub fn forwarded(&self, node: impl Into<PeerId>) -> Self {
        let mut next = self.clone();
        next.path.push(node.into());
        next.ttl = next.ttl.saturating_sub(1);
        next
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn compute_checksum(&self, ttl: u32) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.id.as_bytes(),
            self.sender.as_bytes(),
            self.recipient.as_bytes(),
            self.message_type.as_str().as_bytes(),
            self.payload.to_string().as_bytes(),
        ] {
            hasher.update(part);
            hasher.update([0x1f]);
        }
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(ttl.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heartbeat(ttl: u32) -> MeshMessage {
        MeshMessage::create(
            "phone",
            "laptop",
            MessageType::Heartbeat,
            json!({"type": "heartbeat", "sent_at": 1}),
            ttl,
            1_000,
        )
    }

    #[test]
    fn created_message_verifies() {
        let message = heartbeat(2);
        assert!(message.verify());
        assert_eq!(message.path, vec!["phone".to_string()]);
        assert_eq!(message.checksum.len(), 64);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut message = heartbeat(2);
        message.payload = json!({"type": "heartbeat", "sent_at": 2});
        assert!(!message.verify());

        let mut message = heartbeat(2);
        message.sender = "intruder".into();
        assert!(!message.verify());
    }

    #[test]
    fn forwarding_keeps_checksum_valid() {
        let message = heartbeat(3);
        let hop1 = message.forwarded("tablet");
        let hop2 = hop1.forwarded("desktop");

        assert_eq!(hop2.ttl, 1);
        assert_eq!(hop2.path, vec!["phone", "tablet", "desktop"]);
        assert_eq!(hop2.checksum, message.checksum);
        assert!(hop2.verify());
    }

    #[test]
    fn inflated_ttl_fails_verification() {
        let mut hop = heartbeat(3).forwarded("tablet");
        hop.ttl += 1;
        assert!(!hop.verify());
    }

    #[test]
    fn forwarding_last_hop_exhausts_ttl() {
        let message = heartbeat(1).forwarded("tablet");
        assert_eq!(message.ttl, 0);
        assert!(!message.is_valid());
        assert_eq!(message.forwarded("desktop").ttl, 0);
    }

    #[test]
    fn expiry_window() {
        let message = heartbeat(2);
        assert!(!message.is_expired(1_000 + STALE_AFTER_MS));
        assert!(message.is_expired(1_001 + STALE_AFTER_MS));
        // Clock-skewed senders from the future are not expired
        assert!(!message.is_expired(0));
    }

    #[test]
    fn broadcast_budget_is_capped() {
        let payload = MeshPayload::RecordUpdate {
            record: crate::protocol::RecordPayload {
                id: "todo-1".into(),
                fields: Default::default(),
                clock: tandem_engine::VectorClock::for_device("phone"),
                origin: "phone".into(),
                revision: 1,
                deleted: false,
                created_at: 0,
                updated_at: 0,
            },
        };
        let broadcast = MeshMessage::broadcast("phone", &payload, 1_000).unwrap();
        let addressed = MeshMessage::addressed("phone", "laptop", &payload, 1_000).unwrap();

        assert!(broadcast.is_broadcast());
        assert_eq!(broadcast.ttl, BROADCAST_TTL);
        assert_eq!(addressed.ttl, 5);
        assert_eq!(broadcast.decode().unwrap(), payload);
    }

    #[test]
    fn decode_rejects_mismatched_tag() {
        let message = MeshMessage::create(
            "phone",
            "laptop",
            MessageType::SyncRequest,
            json!({"type": "heartbeat", "sent_at": 1}),
            5,
            1_000,
        );
        assert!(matches!(message.decode(), Err(MeshError::Protocol(_))));
    }

    #[test]
    fn bytes_roundtrip() {
        let message = heartbeat(2).forwarded("tablet");
        let parsed = MeshMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, message);
        assert!(parsed.verify());
    }
}
