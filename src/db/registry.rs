//! Per-key connection pool registry
//!
//! Maps pool keys to live pools. The key is either [`GLOBAL_POOL_KEY`]
//! (shared across sessions in the weak auth modes) or a bearer token (one
//! pool per authenticated user). The global pool gets its own slot so the
//! common case skips the map entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Database, DatabasePool, DbError};
use crate::config::DatabaseConfig;

/// Pool key shared by every session in the `token` and `none` auth modes.
pub const GLOBAL_POOL_KEY: &str = "global";

pub struct PoolRegistry {
    database: Arc<dyn Database>,
    pools: Mutex<HashMap<String, Arc<dyn DatabasePool>>>,
    global: Mutex<Option<Arc<dyn DatabasePool>>>,
}

impl PoolRegistry {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self {
            database,
            pools: Mutex::new(HashMap::new()),
            global: Mutex::new(None),
        }
    }

    /// Creates the pool for `key` if one does not already exist.
    ///
    /// The pool build runs without holding the map lock; if another task
    /// won the race in the meantime, the freshly built pool is closed and
    /// the winner's pool stays.
    pub async fn ensure(&self, key: &str, config: &DatabaseConfig) -> Result<(), DbError> {
        if self.get(key).is_some() {
            return Ok(());
        }

        let pool = self.database.open_pool(config).await?;

        let loser = if key == GLOBAL_POOL_KEY {
            let mut global = self.global.lock().expect("pool registry lock");
            if global.is_some() {
                Some(pool)
            } else {
                *global = Some(pool);
                None
            }
        } else {
            let mut pools = self.pools.lock().expect("pool registry lock");
            if pools.contains_key(key) {
                Some(pool)
            } else {
                pools.insert(key.to_string(), pool);
                None
            }
        };

        if let Some(pool) = loser {
            if let Err(e) = pool.close().await {
                tracing::warn!(key, error = %e, "failed to close raced pool");
            }
        }

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DatabasePool>> {
        if key == GLOBAL_POOL_KEY {
            self.global.lock().expect("pool registry lock").clone()
        } else {
            self.pools.lock().expect("pool registry lock").get(key).cloned()
        }
    }

    /// Closes and forgets the pool for `key`. A missing key is a no-op.
    ///
    /// Close failures are logged and the entry is removed regardless, so a
    /// broken pool cannot wedge the registry in a retry loop.
    pub async fn close(&self, key: &str) {
        let pool = if key == GLOBAL_POOL_KEY {
            self.global.lock().expect("pool registry lock").take()
        } else {
            self.pools.lock().expect("pool registry lock").remove(key)
        };

        if let Some(pool) = pool {
            tracing::debug!(key, "closing database pool");
            if let Err(e) = pool.close().await {
                tracing::warn!(key, error = %e, "error closing database pool");
            }
        }
    }

    /// Closes every pool, ignoring individual failures. Shutdown only.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<dyn DatabasePool>)> = {
            let mut pools = self.pools.lock().expect("pool registry lock");
            pools.drain().collect()
        };

        for (key, pool) in drained {
            if let Err(e) = pool.close().await {
                tracing::warn!(key, error = %e, "error closing database pool at shutdown");
            }
        }

        let global = self.global.lock().expect("pool registry lock").take();
        if let Some(pool) = global {
            if let Err(e) = pool.close().await {
                tracing::warn!(key = GLOBAL_POOL_KEY, error = %e, "error closing global pool");
            }
        }
    }

    /// Probes the pool for `key`; absent pools count as dead.
    pub async fn test(&self, key: &str) -> bool {
        match self.get(key) {
            Some(pool) => pool.probe().await,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        let map = self.pools.lock().expect("pool registry lock").len();
        let global = usize::from(self.global.lock().expect("pool registry lock").is_some());
        map + global
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
