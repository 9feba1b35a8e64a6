use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use permsync_engine::CycleError;
use permsync_store::StoreError;

use crate::validate::FieldError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Validation(FieldError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid admin token")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Only application/json responses are available")]
    NotAcceptable,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("List could not be parsed: {0}")]
    Unprocessable(String),

    #[error("List could not be fetched: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FieldError> for ServerError {
    fn from(e: FieldError) -> Self {
        ServerError::Validation(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("no such record".into()),
            StoreError::Conflict(msg) => ServerError::Conflict(msg),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<CycleError> for ServerError {
    fn from(e: CycleError) -> Self {
        match e {
            CycleError::SubscriptionGone(id) => ServerError::NotFound(format!("subscription {id}")),
            CycleError::Fetch(e) => ServerError::Upstream(e.to_string()),
            CycleError::Parse(e) => ServerError::Unprocessable(e.to_string()),
            CycleError::Store(e) => e.into(),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Validation(_) | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            ServerError::Validation(e) => serde_json::json!({
                "error": self.to_string(),
                "field": e.field,
            }),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                serde_json::json!({ "error": "Internal server error" })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, axum::Json(body)).into_response()
    }
}
