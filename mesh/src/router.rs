//! Forwarding and deduplication for mesh messages.

use dashmap::DashMap;
use tandem_engine::Timestamp;

use crate::message::{MeshMessage, STALE_AFTER_MS};
use crate::protocol::{PeerId, BROADCAST};

/// Why an inbound message was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// This node is already on the traversal path
    Loop,
    /// Checksum mismatch
    IntegrityFailure,
    /// Older than the staleness window
    Expired,
    /// Message id seen before
    Duplicate,
    /// Neither for us nor forwardable
    NotForMe,
}

/// Routing decision for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Hand to the local node only
    Deliver,
    /// Hand to the local node and pass the forwarded copy on
    DeliverAndForward(MeshMessage),
    /// Pass the forwarded copy on
    Forward(MeshMessage),
    Drop(DropReason),
}

/// Per-node router.
#[derive(Debug)]
pub struct Router {
    local_id: PeerId,
    /// Message ids seen, with the time they were first seen
    seen: DashMap<String, Timestamp>,
}

impl Router {
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        Self {
            local_id: local_id.into(),
            seen: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Addressed to this node, or a broadcast.
    pub fn is_for_me(&self, message: &MeshMessage) -> bool {
        message.recipient == self.local_id || message.recipient == BROADCAST
    }

    /// Budget left, not terminating here, and not yet visited by this node.
    pub fn should_forward(&self, message: &MeshMessage) -> bool {
        message.is_valid()
            && message.recipient != self.local_id
            && !message.has_visited(&self.local_id)
    }

    /// Record a message id as seen. Returns false if it already was.
    pub fn mark_seen(&self, message_id: &str, now: Timestamp) -> bool {
        self.seen.insert(message_id.to_string(), now).is_none()
    }

    /// Decide what to do with an inbound message.
    pub fn route(&self, message: &MeshMessage, now: Timestamp) -> RouteDecision {
        if message.has_visited(&self.local_id) {
            return RouteDecision::Drop(DropReason::Loop);
        }
        if !message.verify() {
            return RouteDecision::Drop(DropReason::IntegrityFailure);
        }
        if message.is_expired(now) {
            return RouteDecision::Drop(DropReason::Expired);
        }
        if !self.mark_seen(&message.id, now) {
            return RouteDecision::Drop(DropReason::Duplicate);
        }

        let deliver = self.is_for_me(message);
        let forward = self.should_forward(message);
        match (deliver, forward) {
            (true, true) => RouteDecision::DeliverAndForward(message.forwarded(self.local_id.clone())),
            (true, false) => RouteDecision::Deliver,
            (false, true) => RouteDecision::Forward(message.forwarded(self.local_id.clone())),
            (false, false) => RouteDecision::Drop(DropReason::NotForMe),
        }
    }

    /// Neighbours a forwarded copy should go to.
    ///
    /// A directly connected recipient gets the message alone; otherwise it
    /// floods to every neighbour not already on the path.
    pub fn forward_targets(&self, message: &MeshMessage, neighbours: &[PeerId]) -> Vec<PeerId> {
        if !message.is_broadcast() && neighbours.contains(&message.recipient) {
            return vec![message.recipient.clone()];
        }
        neighbours
            .iter()
            .filter(|peer| !message.has_visited(peer))
            .cloned()
            .collect()
    }

    /// Forget ids older than the staleness window. Returns how many were removed.
    pub fn prune_seen(&self, now: Timestamp) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.saturating_sub(*first_seen) <= STALE_AFTER_MS);
        before.saturating_sub(self.seen.len())
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
