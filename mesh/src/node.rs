//! A running mesh node: coordinator plus its background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::coordinator::MeshSyncCoordinator;
use crate::config::SyncConfig;
use crate::discovery::PeerDiscovery;
use crate::link::{PeerLink, Transport};
use crate::replica::Replica;

pub struct MeshNode {
    coordinator: Arc<MeshSyncCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Wire a node and start inbound dispatch and change propagation.
    ///
    /// Timers are started separately with [`MeshNode::spawn_timers`].
    pub fn start(
        discovery: PeerDiscovery,
        replica: Arc<Replica>,
        transport: Arc<dyn Transport>,
        sync: SyncConfig,
    ) -> Self {
        let (link, events) = PeerLink::new(discovery.local().id.clone(), transport);
        let changes = replica.subscribe();
        let coordinator = Arc::new(MeshSyncCoordinator::new(
            replica,
            Arc::new(discovery),
            link,
            sync,
        ));

        let tasks = vec![
            tokio::spawn(Arc::clone(&coordinator).run(events)),
            tokio::spawn(Arc::clone(&coordinator).propagate(changes)),
        ];
        tracing::info!(node_id = %coordinator.local_id(), "Mesh node started");

        Self { coordinator, tasks }
    }

    /// Start presence, scan, heartbeat and sync timers.
    pub fn spawn_timers(&mut self) {
        let discovery = self.coordinator.discovery().config().clone();
        let sync_interval = self.coordinator.config().interval;

        self.every(discovery.presence_interval, |c| async move {
            if let Err(e) = c.announce() {
                tracing::warn!("Presence broadcast failed: {}", e);
            }
        });
        self.every(discovery.scan_interval, |c| async move {
            let found = c.discover().await;
            if found > 0 {
                tracing::info!(found, "Scan found new peers");
            }
            if let Err(e) = c.probe() {
                tracing::debug!("Probe failed: {}", e);
            }
        });
        self.every(discovery.heartbeat_interval, |c| async move {
            c.heartbeat();
        });
        self.every(sync_interval, |c| async move {
            c.sync_with_all_peers().await;
        });
    }

    fn every<F, Fut>(&mut self, period: Duration, tick: F)
    where
        F: Fn(Arc<MeshSyncCoordinator>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let coordinator = Arc::clone(&self.coordinator);
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick(Arc::clone(&coordinator)).await;
            }
        }));
    }

    pub fn coordinator(&self) -> &Arc<MeshSyncCoordinator> {
        &self.coordinator
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        self.coordinator.link()
    }

    pub fn replica(&self) -> &Arc<Replica> {
        self.coordinator.replica()
    }

    /// Stop background tasks and drop every link.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for peer_id in self.coordinator.link().connected_peers() {
            self.coordinator.link().disconnect(&peer_id);
        }
        tracing::info!(node_id = %self.coordinator.local_id(), "Mesh node stopped");
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
