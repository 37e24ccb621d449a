//! Entity mount points.
//!
//! Every collection exposes the same surface:
//!
//! - `GET    /<collection>` - list, 200 JSON array
//! - `POST   /<collection>` - create from JSON body, 204 + `X-Entity-Id`
//! - `GET    /<collection>/{id}` - fetch, 200 JSON
//! - `PUT    /<collection>/{id}` - load, merge body, update, 204
//! - `DELETE /<collection>/{id}` - intent-delete, 204
//!
//! An ill-formed ULID segment is a 404 (the route exists, the resource
//! cannot); an unconfigured method on a known path is a 405 with `Allow`.

pub mod disks;
pub mod flavors;
pub mod images;
pub mod projects;
pub mod servers;

use std::str::FromStr;

use serde_json::Value;

use minicloud_db::model::Entity;

use crate::error::{ApiError, ApiResult};

/// Response header carrying a freshly-created entity's ID.
pub const ENTITY_ID_HEADER: &str = "x-entity-id";

/// Parses a path ULID, mapping failure to a plain 404.
pub(crate) fn parse_id<I: FromStr>(raw: &str) -> ApiResult<I> {
    raw.parse().map_err(|_| ApiError::unparsable_id())
}

/// Overlays a JSON body onto a record, field by field at the top level.
///
/// Revisions and the `original` snapshot survive the merge, so the result
/// is ready for an optimistic-concurrency update.
pub(crate) fn merge_entity<E: Entity>(base: &E, body: &Value) -> ApiResult<E> {
    let mut value = serde_json::to_value(base)
        .map_err(|e| ApiError::Internal(format!("failed to encode record: {e}")))?;
    let (Some(object), Some(body_object)) = (value.as_object_mut(), body.as_object()) else {
        return Err(ApiError::BadRequest("request body must be a JSON object".into()));
    };
    for (key, field) in body_object {
        object.insert(key.clone(), field.clone());
    }
    let mut merged: E = serde_json::from_value(value)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
    merged.header_mut().create_rev = base.header().create_rev;
    merged.header_mut().modify_rev = base.header().modify_rev;
    if let Some(original) = base.original() {
        merged.set_original(Some(Box::new(original.clone())));
    }
    Ok(merged)
}
