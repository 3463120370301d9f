//! In-process transport for tests and simulations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Connection, PeerLink, Transport};
use crate::error::LinkError;
use crate::protocol::PeerId;

/// A set of in-process nodes that can dial each other by id.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerId, Weak<PeerLink>>,
    /// Nodes refusing new connections
    offline: Mutex<HashSet<PeerId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport dialing from `local_id` into this network.
    pub fn transport(self: &Arc<Self>, local_id: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            local_id: local_id.into(),
            network: Arc::clone(self),
        }
    }

    /// Make a node's link reachable to others.
    pub fn register(&self, link: &Arc<PeerLink>) {
        self.nodes
            .insert(link.local_id().clone(), Arc::downgrade(link));
    }

    /// Refuse or accept new connections to `node`.
    pub fn set_online(&self, node: &str, online: bool) {
        if let Ok(mut offline) = self.offline.lock() {
            if online {
                offline.remove(node);
            } else {
                offline.insert(node.to_string());
            }
        }
    }

    fn is_online(&self, node: &str) -> bool {
        self.offline
            .lock()
            .map(|offline| !offline.contains(node))
            .unwrap_or(false)
    }
}

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local_id: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer_id: &str, _address: &str) -> Result<Connection, LinkError> {
        if !self.network.is_online(peer_id) || !self.network.is_online(&self.local_id) {
            return Err(LinkError::ConnectionFailed(format!("{peer_id} is offline")));
        }
        let remote = self
            .network
            .nodes
            .get(peer_id)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| LinkError::ConnectionFailed(format!("no node named {peer_id}")))?;

        let (to_remote, remote_rx) = mpsc::unbounded_channel();
        let (to_local, local_rx) = mpsc::unbounded_channel();

        remote.attach(
            &self.local_id,
            Connection {
                sender: to_local,
                receiver: remote_rx,
            },
        );

        Ok(Connection {
            sender: to_remote,
            receiver: local_rx,
        })
    }
}
