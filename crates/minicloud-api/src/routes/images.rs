//! Image routes, including the content-upload endpoint.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use md5::{Digest, Md5};
use serde_json::Value;

use minicloud_ceph::ByteStream;
use minicloud_core::{retry, ImageId, Initiator, State as EntityState};
use minicloud_db::model::Image;

use crate::error::{ApiError, ApiResult};
use crate::routes::{merge_entity, parse_id, ENTITY_ID_HEADER};
use crate::server::AppState;

/// Mounts the collection, including the raw-content upload.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(fetch).put(update).delete(remove))
        .route("/:id/contents", axum::routing::put(upload_contents))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Image>>> {
    Ok(Json(state.conn.images().list().await?))
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let mut image = merge_entity(&state.conn.images().new_entity(), &body)?;
    state.conn.images().create(&mut image).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [(ENTITY_ID_HEADER, image.header.id.to_string())],
    ))
}

async fn fetch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Image>> {
    let id: ImageId = parse_id(&id)?;
    Ok(Json(state.conn.images().get(id).await?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<StatusCode> {
    let id: ImageId = parse_id(&id)?;
    let current = state.conn.images().get(id).await?;
    let updated = merge_entity(&current, &body)?;
    state
        .conn
        .images()
        .update(&updated, Initiator::User)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id: ImageId = parse_id(&id)?;
    state
        .conn
        .images()
        .intent_delete(id, Initiator::User)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_image_error(state: &AppState, id: ImageId) {
    let conn = state.conn.as_ref();
    let result = retry(&state.shutdown, || async move {
        let mut image = conn.images().get(id).await?;
        conn.machines()
            .image
            .change_state(&mut image, EntityState::Error, Initiator::System)?;
        conn.images().update(&image, Initiator::System).await
    })
    .await;
    if let Err(e) = result {
        tracing::error!(image_id = %id, error = %e, "failed to park image in error");
    }
}

/// `PUT /images/{id}/contents`: streams a raw image body into the storage
/// cluster and records its MD5.
///
/// Requires `Content-Length` (411 otherwise). The image moves through
/// `Uploading` and ends `Ready` with the checksum set, or `Error` when
/// the upload or the finalising update fails.
pub async fn upload_contents(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> ApiResult<StatusCode> {
    let id: ImageId = parse_id(&id)?;

    let length: u64 = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .filter(|length| *length > 0)
        .ok_or(ApiError::LengthRequired)?;

    let mut image = state.conn.images().get(id).await?;
    state
        .conn
        .machines()
        .image
        .change_state(&mut image, EntityState::Uploading, Initiator::System)
        .map_err(ApiError::from)?;
    state
        .conn
        .images()
        .update(&image, Initiator::System)
        .await?;

    let digest = Arc::new(Mutex::new(Md5::new()));
    let hashing = digest.clone();
    let content: ByteStream = Box::pin(request.into_body().into_data_stream().map(
        move |chunk| match chunk {
            Ok(bytes) => {
                hashing.lock().expect("digest lock poisoned").update(&bytes);
                Ok(bytes)
            }
            Err(e) => Err(std::io::Error::other(e)),
        },
    ));

    if let Err(e) = state
        .store
        .import_image(&id.to_string(), length, content)
        .await
    {
        set_image_error(&state, id).await;
        return Err(e.into());
    }

    let checksum = format!(
        "{:x}",
        digest.lock().expect("digest lock poisoned").clone().finalize()
    );
    let conn = state.conn.as_ref();
    let finalise = retry(&state.shutdown, || {
        let checksum = checksum.clone();
        async move {
            let mut image = conn.images().get(id).await?;
            conn.machines()
                .image
                .change_state(&mut image, EntityState::Ready, Initiator::System)?;
            image.checksum = checksum;
            conn.images().update(&image, Initiator::System).await
        }
    })
    .await;
    if let Err(e) = finalise {
        set_image_error(&state, id).await;
        return Err(e.into());
    }
    Ok(StatusCode::NO_CONTENT)
}
