pub mod create_order;
pub mod get_order;
pub mod health;

use axum::{http::StatusCode, Json};
use serde::Serialize;
use storage::StorageError;

use crate::service::ServiceError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map a service failure onto an HTTP status with a JSON body.
pub fn error_response(err: &ServiceError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Validation(_) | ServiceError::Decode(_) => StatusCode::BAD_REQUEST,
        ServiceError::Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
        ServiceError::InvalidState(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Storage(_) | ServiceError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
