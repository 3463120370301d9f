//! Peer discovery and liveness tracking.
//!
//! Each known peer moves through `Discovered -> Connected ->
//! (Unreachable | Discovered)`. Peers are learned from [`DiscoverySource`]s
//! and from presence traffic, kept fresh by heartbeats, marked unreachable
//! after `stale_after` of silence and forgotten after `evict_after`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tandem_engine::Timestamp;

use crate::config::{DiscoveryConfig, SeedPeer};
use crate::error::Result;
use crate::protocol::{Announcement, Capabilities, PeerId};

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Discovered,
    Connected,
    Unreachable,
}

/// A discovered remote device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub address: Option<String>,
    /// Last time anything was heard from the peer (milliseconds since epoch)
    pub last_seen: Timestamp,
    pub capabilities: Capabilities,
    pub status: PeerStatus,
}

impl Peer {
    pub fn is_available(&self) -> bool {
        self.status != PeerStatus::Unreachable
    }
}

/// Something that yields reachable peer addresses.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    /// Peers currently visible through this source.
    async fn scan(&self) -> Result<Vec<Announcement>>;
}

/// Fixed peer list, usually from `SEED_PEERS`.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    peers: Vec<SeedPeer>,
}

impl StaticSource {
    pub fn new(peers: Vec<SeedPeer>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn scan(&self) -> Result<Vec<Announcement>> {
        Ok(self
            .peers
            .iter()
            .map(|seed| Announcement {
                id: seed.id.clone(),
                name: seed.id.clone(),
                address: Some(seed.address.clone()),
                capabilities: Capabilities::default(),
            })
            .collect())
    }
}

/// Result of a staleness sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub unreachable: Vec<PeerId>,
    pub evicted: Vec<PeerId>,
}

/// The live peer table.
pub struct PeerDiscovery {
    local: Announcement,
    peers: DashMap<PeerId, Peer>,
    sources: Vec<Arc<dyn DiscoverySource>>,
    config: DiscoveryConfig,
}

impl PeerDiscovery {
    pub fn new(local: Announcement, config: DiscoveryConfig) -> Self {
        Self {
            local,
            peers: DashMap::new(),
            sources: Vec::new(),
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    /// How this node announces itself.
    pub fn local(&self) -> &Announcement {
        &self.local
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Record a peer announcement. Returns true for a peer not seen before.
    pub fn observe(&self, node: &Announcement, now: Timestamp) -> bool {
        if node.id == self.local.id {
            return false;
        }
        let mut is_new = false;
        self.peers
            .entry(node.id.clone())
            .and_modify(|peer| {
                peer.name = node.name.clone();
                if node.address.is_some() {
                    peer.address = node.address.clone();
                }
                peer.capabilities = node.capabilities;
                peer.last_seen = now;
                if peer.status == PeerStatus::Unreachable {
                    tracing::info!(peer_id = %peer.id, "Peer reachable again");
                    peer.status = PeerStatus::Discovered;
                }
            })
            .or_insert_with(|| {
                is_new = true;
                tracing::info!(peer_id = %node.id, name = %node.name, "Peer discovered");
                Peer {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    address: node.address.clone(),
                    last_seen: now,
                    capabilities: node.capabilities,
                    status: PeerStatus::Discovered,
                }
            });
        is_new
    }

    /// Register a peer reported by a discovery source. Returns true for a
    /// peer not seen before.
    ///
    /// A source only says where a peer might be, so known peers get their
    /// name and address refreshed while status and last-seen are left to
    /// actual traffic.
    pub fn register(&self, node: &Announcement, now: Timestamp) -> bool {
        if node.id == self.local.id {
            return false;
        }
        let mut is_new = false;
        self.peers
            .entry(node.id.clone())
            .and_modify(|peer| {
                peer.name = node.name.clone();
                if node.address.is_some() {
                    peer.address = node.address.clone();
                }
            })
            .or_insert_with(|| {
                is_new = true;
                tracing::info!(peer_id = %node.id, name = %node.name, "Peer registered");
                Peer {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    address: node.address.clone(),
                    last_seen: now,
                    capabilities: node.capabilities,
                    status: PeerStatus::Discovered,
                }
            });
        is_new
    }

    /// Refresh a peer's last-seen time. Returns false for unknown peers.
    pub fn heartbeat(&self, peer_id: &str, now: Timestamp) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut peer) => {
                peer.last_seen = now;
                if peer.status == PeerStatus::Unreachable {
                    peer.status = PeerStatus::Discovered;
                }
                true
            }
            None => false,
        }
    }

    /// A link to the peer is up.
    pub fn mark_connected(&self, peer_id: &str, now: Timestamp) {
        let mut peer = self.peers.entry(peer_id.to_string()).or_insert_with(|| Peer {
            id: peer_id.to_string(),
            name: peer_id.to_string(),
            address: None,
            last_seen: now,
            capabilities: Capabilities::default(),
            status: PeerStatus::Discovered,
        });
        if peer.status != PeerStatus::Connected {
            tracing::debug!(peer_id = %peer_id, "Peer connected");
        }
        peer.status = PeerStatus::Connected;
        peer.last_seen = now;
    }

    /// The link to the peer went away; it may still be dialable.
    pub fn mark_disconnected(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            if peer.status == PeerStatus::Connected {
                tracing::debug!(peer_id = %peer_id, "Peer disconnected");
                peer.status = PeerStatus::Discovered;
            }
        }
    }

    /// A dial attempt failed.
    pub fn mark_unreachable(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            if peer.status != PeerStatus::Unreachable {
                tracing::info!(peer_id = %peer_id, "Peer unreachable");
                peer.status = PeerStatus::Unreachable;
            }
        }
    }

    /// Move silent peers to Unreachable and forget long-silent ones.
    pub fn sweep(&self, now: Timestamp) -> Sweep {
        let stale_ms = self.config.stale_after.as_millis() as u64;
        let evict_ms = self.config.evict_after.as_millis() as u64;
        let mut sweep = Sweep::default();

        self.peers.retain(|id, peer| {
            let silence = now.saturating_sub(peer.last_seen);
            if silence > evict_ms {
                tracing::info!(peer_id = %id, "Evicting silent peer");
                sweep.evicted.push(id.clone());
                return false;
            }
            if silence > stale_ms && peer.status != PeerStatus::Unreachable {
                tracing::info!(peer_id = %id, silence_ms = silence, "Peer went stale");
                peer.status = PeerStatus::Unreachable;
                sweep.unreachable.push(id.clone());
            }
            true
        });
        sweep
    }

    /// Query every source and register what it returns. Returns the number
    /// of new peers. A failing source is logged and skipped.
    pub async fn scan(&self, now: Timestamp) -> usize {
        let mut found = 0;
        for source in &self.sources {
            match source.scan().await {
                Ok(nodes) => {
                    for node in &nodes {
                        if self.register(node, now) {
                            found += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(source = source.name(), "Discovery scan failed: {}", e);
                }
            }
        }
        found
    }

    /// Connected and freshly discovered peers; never unreachable ones.
    pub fn available_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .filter(|entry| entry.is_available())
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Every known peer, sorted by id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.get(peer_id).map(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use std::time::Duration;

    fn announcement(id: &str) -> Announcement {
        Announcement {
            id: id.into(),
            name: format!("{id}'s device"),
            address: Some(format!("{id}.local:7400")),
            capabilities: Capabilities::default(),
        }
    }

    fn discovery() -> PeerDiscovery {
        PeerDiscovery::new(
            announcement("me"),
            DiscoveryConfig {
                stale_after: Duration::from_secs(30),
                evict_after: Duration::from_secs(300),
                ..DiscoveryConfig::default()
            },
        )
    }

    #[test]
    fn observe_adds_and_refreshes() {
        let discovery = discovery();
        assert!(discovery.observe(&announcement("laptop"), 1_000));
        assert!(!discovery.observe(&announcement("laptop"), 2_000));

        let peer = discovery.get("laptop").unwrap();
        assert_eq!(peer.status, PeerStatus::Discovered);
        assert_eq!(peer.last_seen, 2_000);
        assert_eq!(peer.address.as_deref(), Some("laptop.local:7400"));
    }

    #[test]
    fn ignores_own_announcement() {
        let discovery = discovery();
        assert!(!discovery.observe(&announcement("me"), 1_000));
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn lifecycle_through_unreachable() {
        let discovery = discovery();
        discovery.observe(&announcement("laptop"), 0);
        discovery.mark_connected("laptop", 0);
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Connected);

        let sweep = discovery.sweep(31_000);
        assert_eq!(sweep.unreachable, vec!["laptop".to_string()]);
        assert!(discovery.available_peers().is_empty());

        // A later heartbeat brings it back
        assert!(discovery.heartbeat("laptop", 40_000));
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Discovered);
        assert_eq!(discovery.available_peers().len(), 1);
    }

    #[test]
    fn long_silence_evicts() {
        let discovery = discovery();
        discovery.observe(&announcement("laptop"), 0);
        discovery.observe(&announcement("phone"), 290_000);

        let sweep = discovery.sweep(301_000);
        assert_eq!(sweep.evicted, vec!["laptop".to_string()]);
        assert!(discovery.get("laptop").is_none());
        assert!(discovery.get("phone").is_some());
    }

    #[test]
    fn disconnect_keeps_peer_available() {
        let discovery = discovery();
        discovery.mark_connected("laptop", 0);
        discovery.mark_disconnected("laptop");
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Discovered);

        discovery.mark_unreachable("laptop");
        assert!(discovery.available_peers().is_empty());
    }

    #[tokio::test]
    async fn rescanning_a_silent_seed_does_not_revive_it() {
        let seeds = vec![SeedPeer {
            id: "laptop".into(),
            address: "10.0.0.2:7400".into(),
        }];
        let discovery = discovery().with_source(Arc::new(StaticSource::new(seeds)));

        assert_eq!(discovery.scan(0).await, 1);
        discovery.mark_connected("laptop", 0);

        // Scan timer keeps running, the peer never answers
        let mut went_stale = Vec::new();
        for tick in 1..=12u64 {
            let now = tick * 10_000;
            discovery.scan(now).await;
            went_stale.extend(discovery.sweep(now).unreachable);
        }
        assert_eq!(went_stale, vec!["laptop".to_string()]);
        let peer = discovery.get("laptop").unwrap();
        assert_eq!(peer.status, PeerStatus::Unreachable);
        assert_eq!(peer.last_seen, 0);

        discovery.scan(130_000).await;
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Unreachable);

        // Evicted once silent for long enough, then registered afresh
        assert_eq!(discovery.sweep(301_000).evicted, vec!["laptop".to_string()]);
        assert_eq!(discovery.scan(302_000).await, 1);
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Discovered);

        // Only real traffic brings a peer back
        discovery.mark_unreachable("laptop");
        assert!(discovery.heartbeat("laptop", 303_000));
        assert_eq!(discovery.get("laptop").unwrap().status, PeerStatus::Discovered);
    }

    struct FailingSource;

    #[async_trait]
    impl DiscoverySource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn scan(&self) -> Result<Vec<Announcement>> {
            Err(MeshError::Protocol("interface down".into()))
        }
    }

    #[tokio::test]
    async fn scan_merges_sources_and_skips_failures() {
        let seeds = vec![
            SeedPeer {
                id: "laptop".into(),
                address: "10.0.0.2:7400".into(),
            },
            SeedPeer {
                id: "phone".into(),
                address: "10.0.0.3:7400".into(),
            },
        ];
        let discovery = discovery()
            .with_source(Arc::new(FailingSource))
            .with_source(Arc::new(StaticSource::new(seeds)));

        assert_eq!(discovery.scan(1_000).await, 2);
        assert_eq!(discovery.scan(2_000).await, 0);
        let ids: Vec<_> = discovery.available_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["laptop", "phone"]);
    }
}
