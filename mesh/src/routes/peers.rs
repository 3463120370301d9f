//! Discovery table.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::coordinator::PeerSyncState;
use crate::discovery::Peer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    #[serde(flatten)]
    pub peer: Peer,
    pub linked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<PeerSyncState>,
    pub pending_retries: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/peers", get(list_peers))
}

/// GET /peers - Every known peer with link and sync state.
async fn list_peers(State(state): State<AppState>) -> Json<Vec<PeerView>> {
    let coordinator = &state.coordinator;
    let peers = coordinator
        .discovery()
        .peers()
        .into_iter()
        .map(|peer| PeerView {
            linked: coordinator.link().is_connected(&peer.id),
            last_sync: coordinator.peer_sync_state(&peer.id),
            pending_retries: coordinator.pending_retries(&peer.id),
            peer,
        })
        .collect();
    Json(peers)
}
