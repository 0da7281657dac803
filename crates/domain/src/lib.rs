//! Order aggregate shared by the ingestion pipeline, the store and the cache.

pub mod aggregates;
pub mod errors;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use aggregates::{Delivery, Item, Order, Payment};
pub use errors::DomainError;
