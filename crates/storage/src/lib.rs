pub mod cache;
pub mod repositories;

pub use cache::{OrderCache, TtlCache};
pub use repositories::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Order already exists: {0}")]
    Conflict(String),

    #[error("Order not found: {0}")]
    NotFound(String),
}
