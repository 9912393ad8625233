pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod middleware;
pub mod services;
pub mod stdio;

// Make test_utils available for both unit tests and integration tests
pub mod test_utils;

use std::sync::Arc;

use config::{AuthMode, ServerConfig};
use db::{Database, PoolRegistry};
use mcp::McpSessionManager;
use services::token_service::{CleanupFn, CleanupFuture};
use services::{AuthThrottle, RateLimiter, TokenService};

/// The per-process singletons, owned here and threaded through every
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub pools: Arc<PoolRegistry>,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<McpSessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_throttle: Arc<AuthThrottle>,
}

impl AppState {
    /// Wires the components together.
    ///
    /// In required auth mode the token manager gets a cleanup callback
    /// that closes the dead token's MCP sessions and then its pool.
    /// Sessions go first, so nothing in flight outlives its pool.
    pub fn new(config: ServerConfig, database: Arc<dyn Database>) -> Self {
        let config = Arc::new(config);
        let pools = Arc::new(PoolRegistry::new(database));
        let sessions = Arc::new(McpSessionManager::default());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let auth_throttle = Arc::new(AuthThrottle::default());

        let cleanup: Option<CleanupFn> = if config.auth_mode == AuthMode::Required {
            let pools = pools.clone();
            let sessions = sessions.clone();
            Some(Arc::new(move |token: String| {
                let pools = pools.clone();
                let sessions = sessions.clone();
                let fut: CleanupFuture = Box::pin(async move {
                    sessions.close_by_pool_key(&token).await;
                    pools.close(&token).await;
                });
                fut
            }))
        } else {
            None
        };

        let tokens = Arc::new(TokenService::new(
            config.max_sessions,
            config.token_expiry_secs,
            cleanup,
        ));

        Self {
            config,
            pools,
            tokens,
            sessions,
            rate_limiter,
            auth_throttle,
        }
    }
}
