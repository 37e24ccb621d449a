//! Disk routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use minicloud_core::{DiskId, Initiator};
use minicloud_db::model::Disk;

use crate::error::ApiResult;
use crate::routes::{merge_entity, parse_id, ENTITY_ID_HEADER};
use crate::server::AppState;

/// Mounts the collection.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(fetch).put(update).delete(remove))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Disk>>> {
    Ok(Json(state.conn.disks().list().await?))
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let mut disk = merge_entity(&state.conn.disks().new_entity(), &body)?;
    state.conn.disks().create(&mut disk).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [(ENTITY_ID_HEADER, disk.header.id.to_string())],
    ))
}

async fn fetch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Disk>> {
    let id: DiskId = parse_id(&id)?;
    Ok(Json(state.conn.disks().get(id).await?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<StatusCode> {
    let id: DiskId = parse_id(&id)?;
    let current = state.conn.disks().get(id).await?;
    let updated = merge_entity(&current, &body)?;
    state.conn.disks().update(&updated, Initiator::User).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id: DiskId = parse_id(&id)?;
    state
        .conn
        .disks()
        .intent_delete(id, Initiator::User)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
