use std::sync::Arc;

use storage::OrderRepository;

use crate::service::OrderService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrderService>,
    /// Used by the health check to ping the store directly
    pub repository: Arc<dyn OrderRepository>,
}

impl AppState {
    pub fn new(service: Arc<OrderService>, repository: Arc<dyn OrderRepository>) -> Self {
        Self {
            service,
            repository,
        }
    }
}
