//! Bearer token lifecycle
//!
//! Tokens are opaque 256-bit values bound to one database identity. The
//! service owns the token map, enforces the concurrent-session cap
//! atomically inside [`TokenService::create`], and invokes a cleanup
//! callback exactly once per token when it dies (expiry, revocation or
//! shutdown) so the orchestrator can release the token's pool.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseConfig;

/// TTL bounds applied to client-requested durations.
pub const MIN_TOKEN_TTL_SECS: u64 = 1;
pub const MAX_TOKEN_TTL_SECS: u64 = 86_400;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const TOKEN_BYTES: usize = 32;

pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked once per dead token with the token value, which doubles as the
/// pool key in required-auth mode.
pub type CleanupFn = Arc<dyn Fn(String) -> CleanupFuture + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Token not found or expired")]
    NotFound,

    #[error("Token expired")]
    Expired,

    #[error("Maximum concurrent sessions reached")]
    SessionLimit,
}

#[derive(Clone, Debug)]
pub struct TokenSession {
    pub token: String,
    pub config: Arc<DatabaseConfig>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub mcp_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedToken {
    pub token: String,
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

pub struct TokenService {
    max_sessions: usize,
    default_ttl_secs: u64,
    sessions: Mutex<HashMap<String, TokenSession>>,
    cleanup: Option<CleanupFn>,
}

impl TokenService {
    pub fn new(max_sessions: usize, default_ttl_secs: u64, cleanup: Option<CleanupFn>) -> Self {
        Self {
            max_sessions,
            default_ttl_secs,
            sessions: Mutex::new(HashMap::new()),
            cleanup,
        }
    }

    /// Mints a token for `config`, enforcing the session cap atomically
    /// with the insertion. Races past [`can_create`](Self::can_create)
    /// land here and still cannot exceed the cap.
    pub fn create(
        &self,
        config: Arc<DatabaseConfig>,
        ttl_secs: Option<u64>,
    ) -> Result<CreatedToken, TokenError> {
        let ttl = ttl_secs
            .unwrap_or(self.default_ttl_secs)
            .clamp(MIN_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS);

        let token = mint_token();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl as i64);

        {
            let mut sessions = self.sessions.lock().expect("token map lock");
            if sessions.len() >= self.max_sessions {
                return Err(TokenError::SessionLimit);
            }
            sessions.insert(
                token.clone(),
                TokenSession {
                    token: token.clone(),
                    config,
                    created_at: now,
                    expires_at,
                    last_used_at: now,
                    mcp_session_id: None,
                },
            );
        }

        tracing::info!(
            token = %fingerprint(&token),
            expires_in = ttl,
            "session token created"
        );

        Ok(CreatedToken {
            token,
            expires_in: ttl,
            expires_at,
        })
    }

    /// Looks the token up, expiring it on the spot when past its deadline.
    pub async fn validate(&self, token: &str) -> Result<TokenSession, TokenError> {
        if token.is_empty() {
            return Err(TokenError::InvalidFormat);
        }

        let now = Utc::now();
        let outcome = {
            let mut sessions = self.sessions.lock().expect("token map lock");
            match sessions.get_mut(token) {
                None => Err(TokenError::NotFound),
                Some(session) if now > session.expires_at => {
                    sessions.remove(token);
                    Err(TokenError::Expired)
                }
                Some(session) => {
                    session.last_used_at = now;
                    Ok(session.clone())
                }
            }
        };

        if matches!(outcome, Err(TokenError::Expired)) {
            tracing::debug!(token = %fingerprint(token), "token expired during validation");
            self.run_cleanup(token.to_string()).await;
        }

        outcome
    }

    /// Deletes the token, returning whether anything was deleted.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().expect("token map lock");
            sessions.remove(token).is_some()
        };

        if removed {
            tracing::info!(token = %fingerprint(token), "session token revoked");
            self.run_cleanup(token.to_string()).await;
        }
        removed
    }

    /// Records the MCP session attached to this token. Last write wins on
    /// repeat calls.
    pub fn attach(&self, token: &str, mcp_session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("token map lock");
        match sessions.get_mut(token) {
            Some(session) => {
                session.mcp_session_id = Some(mcp_session_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Advisory capacity check; `create` remains the authority.
    pub fn can_create(&self) -> bool {
        self.sessions.lock().expect("token map lock").len() < self.max_sessions
    }

    pub fn size(&self) -> usize {
        self.sessions.lock().expect("token map lock").len()
    }

    pub fn stats(&self) -> TokenStats {
        let now = Utc::now();
        let sessions = self.sessions.lock().expect("token map lock");
        let total = sessions.len();
        let expired = sessions.values().filter(|s| now > s.expires_at).count();
        TokenStats {
            total,
            active: total - expired,
            expired,
        }
    }

    async fn run_cleanup(&self, token: String) {
        if let Some(cleanup) = &self.cleanup {
            cleanup(token).await;
        }
    }

    /// Removes expired tokens and fires their cleanup callbacks.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut sessions = self.sessions.lock().expect("token map lock");
            let dead: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| now > s.expires_at)
                .map(|(t, _)| t.clone())
                .collect();
            for token in &dead {
                sessions.remove(token);
            }
            dead
        };

        for token in expired {
            tracing::debug!(token = %fingerprint(&token), "expired token swept");
            self.run_cleanup(token).await;
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => service.sweep_expired().await,
                }
            }
        })
    }

    /// Drains every remaining token, invoking the cleanup callback for each.
    pub async fn shutdown(&self) {
        let drained: Vec<String> = {
            let mut sessions = self.sessions.lock().expect("token map lock");
            sessions.drain().map(|(token, _)| token).collect()
        };

        for token in drained {
            self.run_cleanup(token).await;
        }
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Short stable identifier for log lines; never the token itself.
fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}
