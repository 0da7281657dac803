use axum::{extract::State, http::StatusCode, Json};
use domain::Order;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{error_response, ErrorResponse};
use crate::service::ServiceError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_uid: String,
}

/// Store an order submitted over HTTP, bypassing the queue
pub async fn create_order_handler(
    State(state): State<AppState>,
    Json(order): Json<Order>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!("Received order: {}", order.order_uid);

    match state.service.create_order(order).await {
        Ok(order_uid) => Ok((StatusCode::CREATED, Json(CreateOrderResponse { order_uid }))),
        Err(e @ ServiceError::Validation(_)) => {
            warn!("Rejected order: {}", e);
            Err(error_response(&e))
        }
        Err(e) => {
            error!("Failed to create order: {}", e);
            Err(error_response(&e))
        }
    }
}
