//! Peer links: at most one connection per peer.
//!
//! A [`Transport`] dials peers and yields a [`Connection`], a pair of
//! message channels. [`PeerLink`] owns the connection table, pumps every
//! connection's inbound half into a single [`LinkEvent`] stream and reports
//! send failures to the caller instead of retrying.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{serve, TcpTransport};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::message::MeshMessage;
use crate::protocol::PeerId;

/// Sender half of a connection.
pub type MessageSender = mpsc::UnboundedSender<MeshMessage>;

/// Both halves of an established connection.
#[derive(Debug)]
pub struct Connection {
    pub sender: MessageSender,
    pub receiver: mpsc::UnboundedReceiver<MeshMessage>,
}

/// Dials peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `peer_id` at `address`.
    async fn connect(&self, peer_id: &str, address: &str) -> Result<Connection, LinkError>;
}

/// Something that happened on a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected(PeerId),
    /// A message arrived from the neighbour `from`
    Message { from: PeerId, message: MeshMessage },
    Disconnected(PeerId),
}

/// A registered connection.
#[derive(Debug)]
struct PeerConnection {
    /// Distinguishes a replaced connection from the current one
    id: String,
    sender: MessageSender,
}

/// Connection table for one node.
pub struct PeerLink {
    local_id: PeerId,
    transport: Arc<dyn Transport>,
    connections: DashMap<PeerId, PeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl PeerLink {
    /// Create a link layer. The receiver yields every [`LinkEvent`].
    pub fn new(
        local_id: impl Into<PeerId>,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            local_id: local_id.into(),
            transport,
            connections: DashMap::new(),
            events,
        });
        (link, rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Dial a peer unless a connection already exists.
    ///
    /// Returns true when a new connection was opened.
    pub async fn connect(self: &Arc<Self>, peer_id: &str, address: &str) -> Result<bool, LinkError> {
        if self.is_connected(peer_id) {
            return Ok(false);
        }
        let connection = self.transport.connect(peer_id, address).await?;
        self.attach(peer_id, connection);
        Ok(true)
    }

    /// Register an established connection and start pumping its inbound half.
    ///
    /// A previous connection to the same peer is replaced.
    pub fn attach(self: &Arc<Self>, peer_id: &str, connection: Connection) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let Connection {
            sender,
            mut receiver,
        } = connection;

        self.connections.insert(
            peer_id.to_string(),
            PeerConnection {
                id: conn_id.clone(),
                sender,
            },
        );
        tracing::info!(peer_id = %peer_id, conn_id = %conn_id, "Peer link registered");
        let _ = self.events.send(LinkEvent::Connected(peer_id.to_string()));

        let link = Arc::clone(self);
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let event = LinkEvent::Message {
                    from: peer_id.clone(),
                    message,
                };
                if link.events.send(event).is_err() {
                    break;
                }
            }
            link.detach(&peer_id, &conn_id);
        });
    }

    /// Remove the connection only if it is still the one identified by `conn_id`.
    fn detach(&self, peer_id: &str, conn_id: &str) {
        if self
            .connections
            .remove_if(peer_id, |_, conn| conn.id == conn_id)
            .is_some()
        {
            tracing::info!(peer_id = %peer_id, "Peer link closed");
            let _ = self.events.send(LinkEvent::Disconnected(peer_id.to_string()));
        }
    }

    /// Drop the connection to a peer.
    pub fn disconnect(&self, peer_id: &str) {
        if self.connections.remove(peer_id).is_some() {
            tracing::info!(peer_id = %peer_id, "Peer link dropped");
            let _ = self.events.send(LinkEvent::Disconnected(peer_id.to_string()));
        }
    }

    /// Send a message to a directly connected peer.
    pub fn send(&self, peer_id: &str, message: MeshMessage) -> Result<(), LinkError> {
        let result = match self.connections.get(peer_id) {
            Some(conn) => conn
                .sender
                .send(message)
                .map_err(|_| LinkError::ConnectionClosed),
            None => return Err(LinkError::NotConnected(peer_id.to_string())),
        };
        if result.is_err() {
            tracing::warn!(peer_id = %peer_id, "Send on closed link");
            self.disconnect(peer_id);
        }
        result
    }

    /// Inject a message as if it arrived from `from`.
    pub fn deliver(&self, from: &str, message: MeshMessage) {
        let _ = self.events.send(LinkEvent::Message {
            from: from.to_string(),
            message,
        });
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    /// Directly connected peers, sorted by id.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
