//! Shared storage contracts for the order pipeline.
//!
//! Both the durable store (PostgreSQL) and the cache (Redis) speak this
//! vocabulary, so the read path can fall through from one to the other and
//! the processor stays oblivious to which backend it persists into.

use async_trait::async_trait;
use model::Order;
use thiserror::Error;

/// Errors surfaced by any order storage backend.
///
/// `NoOrder` and `EmptyOrder` are sentinels: callers branch on them.
/// Everything else is carried opaquely in `Other`; the read path maps it
/// to a generic failure and the processor withholds the acknowledgement.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The `order_uid` is not present in this backend.
    #[error("no order found")]
    NoOrder,
    /// The order exists but has no line items.
    #[error("no items in order")]
    EmptyOrder,
    /// Backend-specific failure (connection, query, serialization).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Wraps a backend error into the opaque kind.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        StorageError::Other(err.into())
    }

    /// True for the not-found sentinel.
    pub fn is_no_order(&self) -> bool {
        matches!(self, StorageError::NoOrder)
    }
}

/// Keyed order persistence: what the processor writes through and the read
/// handler falls through. Implemented by both the durable store and the
/// cache.
#[async_trait]
pub trait OrderStorage: Send + Sync {
    /// Persists the order. Durable implementations must be atomic and
    /// idempotent on `order_uid`.
    async fn save_order(&self, order: &Order) -> Result<(), StorageError>;

    /// Returns the order with its items, or [`StorageError::NoOrder`].
    async fn get_order(&self, order_uid: &str) -> Result<Order, StorageError>;
}

/// Bulk read used to warm the cache at startup.
#[async_trait]
pub trait OrdersSource: Send + Sync {
    /// Returns every stored order, or [`StorageError::NoOrder`] when the
    /// store is empty.
    async fn get_all_orders(&self) -> Result<Vec<Order>, StorageError>;
}
