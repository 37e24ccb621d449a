//! HTTP error mapping.
//!
//! The wire contract:
//!
//! - validation failure → 400 JSON `{Entity, Field, Message}`
//! - state-machine violation → 400 text
//! - not found → 404 JSON `{Entity, Id}`
//! - optimistic-concurrency conflict → 409 JSON `{Xid}`
//! - everything else → 500 text

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use minicloud_core::Error;

/// The result type of HTTP handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A field-validation failure body.
#[derive(Debug, Serialize)]
pub struct FieldErrorBody {
    /// The entity kind the field belongs to.
    pub entity: &'static str,
    /// The offending field.
    pub field: &'static str,
    /// Human-readable description.
    pub message: String,
}

/// A not-found body.
#[derive(Debug, Serialize)]
pub struct NotFoundBody {
    /// The entity kind that was looked up.
    pub entity: &'static str,
    /// The identifier that was looked up.
    pub id: String,
}

/// A conflict body.
#[derive(Debug, Serialize)]
pub struct ConflictBody {
    /// The transaction that failed to commit.
    pub xid: String,
}

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub enum ApiError {
    /// 400 with a structured field-error body.
    Field(FieldErrorBody),
    /// 400 with a plain-text body (state-machine violations).
    BadRequest(String),
    /// 404 with a structured body.
    NotFound(NotFoundBody),
    /// 404 with a plain-text body (unparsable path id).
    NotFoundText,
    /// 409 with the failing transaction id.
    Conflict(ConflictBody),
    /// 411: upload without a declared length.
    LengthRequired,
    /// 500 with a plain-text body.
    Internal(String),
}

impl ApiError {
    /// A plain 404 for ids that do not parse, matching the router's
    /// behaviour for unknown paths.
    #[must_use]
    pub const fn unparsable_id() -> Self {
        Self::NotFoundText
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Field {
                entity,
                field,
                message,
            } => Self::Field(FieldErrorBody {
                entity: entity.as_str(),
                field,
                message,
            }),
            Error::NotFound { entity, id } => Self::NotFound(NotFoundBody {
                entity: entity.as_str(),
                id,
            }),
            Error::Conflict { xid } => Self::Conflict(ConflictBody { xid }),
            Error::InvalidId { message } => Self::BadRequest(message),
            err @ (Error::InvalidState { .. } | Error::InvalidTransition { .. }) => {
                Self::BadRequest(err.to_string())
            }
            err => Self::Internal(err.to_string()),
        }
    }
}

// Bodies keep the record-style PascalCase key spelling.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FieldErrorWire<'a> {
    entity: &'a str,
    field: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NotFoundWire<'a> {
    entity: &'a str,
    id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConflictWire<'a> {
    xid: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Field(body) => (
                StatusCode::BAD_REQUEST,
                Json(FieldErrorWire {
                    entity: body.entity,
                    field: body.field,
                    message: &body.message,
                }),
            )
                .into_response(),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::NotFound(body) => (
                StatusCode::NOT_FOUND,
                Json(NotFoundWire {
                    entity: body.entity,
                    id: &body.id,
                }),
            )
                .into_response(),
            Self::NotFoundText => {
                (StatusCode::NOT_FOUND, "Resource doesn't exist\n").into_response()
            }
            Self::Conflict(body) => (
                StatusCode::CONFLICT,
                Json(ConflictWire { xid: &body.xid }),
            )
                .into_response(),
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED.into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {message}\n"),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicloud_core::EntityKind;

    #[test]
    fn field_error_maps_to_400() {
        let err: ApiError = Error::field(EntityKind::Project, "Name", "too short").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn conflict_maps_to_409() {
        let err: ApiError = Error::Conflict { xid: "x".into() }.into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn backend_error_maps_to_500() {
        let err: ApiError = Error::backend("boom").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
