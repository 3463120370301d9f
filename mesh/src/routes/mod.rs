//! HTTP control surface for the repository layer.

mod conflicts;
mod health;
mod peers;
mod records;
mod sync;

use std::sync::Arc;

use axum::Router;

use crate::coordinator::MeshSyncCoordinator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<MeshSyncCoordinator>,
}

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(peers::routes())
        .merge(records::routes())
        .merge(conflicts::routes())
        .merge(sync::routes())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{DiscoveryConfig, SyncConfig};
    use crate::discovery::PeerDiscovery;
    use crate::link::{MemoryNetwork, PeerLink};
    use crate::protocol::{Announcement, Capabilities};
    use crate::replica::Replica;
    use crate::repository::MemoryRepository;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use tandem_engine::{ConflictResolver, MergeStrategy};
    use tower::ServiceExt;

    pub fn state(device: &str) -> AppState {
        let network = MemoryNetwork::new();
        let replica = Arc::new(Replica::new(
            Arc::new(MemoryRepository::new(device)),
            ConflictResolver::new(device, MergeStrategy::Manual),
        ));
        let local = Announcement {
            id: device.to_string(),
            name: device.to_string(),
            address: None,
            capabilities: Capabilities::default(),
        };
        let discovery = Arc::new(PeerDiscovery::new(local, DiscoveryConfig::default()));
        let (link, _events) = PeerLink::new(device, Arc::new(network.transport(device)));
        AppState {
            coordinator: Arc::new(MeshSyncCoordinator::new(
                replica,
                discovery,
                link,
                SyncConfig::default(),
            )),
        }
    }

    pub async fn call(state: &AppState, request: Request<Body>) -> Response<Body> {
        create_routes()
            .with_state(state.clone())
            .oneshot(request)
            .await
            .unwrap()
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }
}
