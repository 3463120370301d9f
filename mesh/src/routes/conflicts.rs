//! Conflict listing and manual resolution.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_engine::{Conflict, Record, ResolutionChoice};

use super::AppState;
use crate::error::{MeshError, Result};
use crate::now_millis;

/// Body of a resolve request: exactly one of the two fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Keep this retained version
    pub version_id: Option<String>,
    /// Or use this hand-merged payload
    pub payload: Option<Value>,
}

impl TryFrom<ResolveRequest> for ResolutionChoice {
    type Error = MeshError;

    fn try_from(request: ResolveRequest) -> Result<Self> {
        match (request.version_id, request.payload) {
            (Some(version_id), None) => Ok(ResolutionChoice::Version(version_id)),
            (None, Some(Value::Object(fields))) => Ok(ResolutionChoice::Merged(fields)),
            (None, Some(_)) => Err(MeshError::BadRequest(
                "payload must be a JSON object".into(),
            )),
            _ => Err(MeshError::BadRequest(
                "expected exactly one of versionId or payload".into(),
            )),
        }
    }
}

/// A conflict with the ids its versions are selected by.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictView {
    #[serde(flatten)]
    pub conflict: Conflict,
    pub version_ids: Vec<String>,
}

impl From<Conflict> for ConflictView {
    fn from(conflict: Conflict) -> Self {
        Self {
            version_ids: conflict.version_ids(),
            conflict,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

/// GET /conflicts - Unresolved conflicts.
async fn list_conflicts(State(state): State<AppState>) -> Result<Json<Vec<ConflictView>>> {
    let conflicts = state.coordinator.replica().repository().conflicts().await?;
    Ok(Json(conflicts.into_iter().map(ConflictView::from).collect()))
}

/// POST /conflicts/{id}/resolve
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Record>> {
    let choice = ResolutionChoice::try_from(request)?;
    let record = state
        .coordinator
        .replica()
        .resolve_conflict(&id, choice, now_millis())
        .await?;
    Ok(Json(record))
}
