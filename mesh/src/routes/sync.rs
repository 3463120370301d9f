//! Sync triggers.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};

use super::AppState;
use crate::coordinator::{SyncResult, SyncSummary};
use crate::error::{MeshError, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_all))
        .route("/sync/{peer_id}", post(sync_peer))
}

/// POST /sync - Sync with every available peer.
async fn sync_all(State(state): State<AppState>) -> Json<SyncSummary> {
    Json(state.coordinator.sync_with_all_peers().await)
}

/// POST /sync/{peer_id} - Sync with one peer.
async fn sync_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<SyncResult>> {
    if state.coordinator.discovery().get(&peer_id).is_none() {
        return Err(MeshError::PeerNotFound(peer_id));
    }
    Ok(Json(state.coordinator.sync_with_peer(&peer_id).await))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn sync_without_peers_is_empty() {
        let state = state("phone");
        let response = call(&state, empty_request("POST", "/sync")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"results": []}));
    }

    #[tokio::test]
    async fn unknown_peer_is_404() {
        let state = state("phone");
        let response = call(&state, empty_request("POST", "/sync/laptop")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
