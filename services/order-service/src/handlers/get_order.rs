use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use domain::Order;
use tracing::{error, info};

use super::{error_response, ErrorResponse};
use crate::service::ServiceError;
use crate::state::AppState;

/// Get a single order by its uid
pub async fn get_order_handler(
    State(state): State<AppState>,
    Path(order_uid): Path<String>,
) -> Result<Json<Order>, (StatusCode, Json<ErrorResponse>)> {
    info!("Fetching order: {}", order_uid);

    match state.service.get_order(&order_uid).await {
        Ok(order) => Ok(Json(order.as_ref().clone())),
        Err(ServiceError::NotFound(_)) => {
            info!("Order not found: {}", order_uid);
            Err(error_response(&ServiceError::NotFound(order_uid)))
        }
        Err(e) => {
            error!("Failed to fetch order {}: {}", order_uid, e);
            Err(error_response(&e))
        }
    }
}
