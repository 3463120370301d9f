//! Record endpoints. Local writes go through the replica so they are
//! stamped with this device and propagated to peers.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tandem_engine::{Error as EngineError, Fields, Record};

use super::AppState;
use crate::error::Result;
use crate::now_millis;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Include tombstones
    #[serde(default)]
    pub include_deleted: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/records", get(list_records)).route(
        "/records/{id}",
        get(get_record).put(put_record).delete(delete_record),
    )
}

/// GET /records
async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Record>>> {
    let records = state.coordinator.replica().repository().all().await?;
    Ok(Json(
        records
            .into_iter()
            .filter(|r| query.include_deleted || r.is_active())
            .collect(),
    ))
}

/// GET /records/{id}
async fn get_record(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Record>> {
    match state.coordinator.replica().repository().get(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(EngineError::RecordNotFound(id).into()),
    }
}

/// PUT /records/{id} - Create, or merge fields into an existing record.
async fn put_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<Fields>,
) -> Result<Json<Record>> {
    let record = state.coordinator.replica().put(&id, fields, now_millis()).await?;
    Ok(Json(record))
}

/// DELETE /records/{id}
async fn delete_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Record>> {
    let record = state.coordinator.replica().delete(&id, now_millis()).await?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let state = state("phone");

        let response = call(
            &state,
            json_request("PUT", "/records/todo-1", json!({"title": "Milk"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        assert_eq!(created["clock"]["phone"], 1);

        call(
            &state,
            json_request("PUT", "/records/todo-1", json!({"completed": true})),
        )
        .await;
        let fetched = json_body(call(&state, empty_request("GET", "/records/todo-1")).await).await;
        assert_eq!(fetched["fields"], json!({"title": "Milk", "completed": true}));
        assert_eq!(fetched["revision"], 2);

        let response = call(&state, empty_request("DELETE", "/records/todo-1")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let listed = json_body(call(&state, empty_request("GET", "/records")).await).await;
        assert_eq!(listed, json!([]));
        let listed = json_body(
            call(&state, empty_request("GET", "/records?includeDeleted=true")).await,
        )
        .await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_record_is_404() {
        let state = state("phone");
        let response = call(&state, empty_request("GET", "/records/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(&state, empty_request("DELETE", "/records/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let state = state("phone");
        let response = call(&state, json_request("PUT", "/records/todo-1", json!([1, 2]))).await;
        assert!(response.status().is_client_error());
    }
}
