//! Database collaborator contract
//!
//! The gateway never speaks SQL itself; it routes requests to a
//! [`Database`] implementation that opens pools and to the pools those
//! return. The production implementation is [`SqlxDatabase`]; tests swap
//! in a scriptable double.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::DatabaseConfig;

pub mod registry;
mod sqlx_driver;

pub use registry::{PoolRegistry, GLOBAL_POOL_KEY};
pub use sqlx_driver::SqlxDatabase;

/// Single error type for everything the driver surfaces.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// A handle to one connection pool.
///
/// Rows come back as JSON objects keyed by column name so the protocol
/// layer can serialise them without knowing the dialect's type system.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, DbError>;

    /// Lightweight liveness probe; `false` means the pool is unusable.
    async fn probe(&self) -> bool;

    async fn close(&self) -> Result<(), DbError>;
}

/// Factory for connection pools, one per credential set.
#[async_trait]
pub trait Database: Send + Sync {
    async fn open_pool(&self, config: &DatabaseConfig) -> Result<Arc<dyn DatabasePool>, DbError>;
}
