//! MCP session registry with idle eviction
//!
//! Owns the `(transport, server, accounting)` triple for every stateful
//! session. Sessions die four ways: explicit close, transport close,
//! idle eviction, shutdown. The `is_closing` flag makes each path run
//! `transport.close` and `server.close` at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::server::ProtocolServer;
use super::transport::HttpTransport;

const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct McpSession {
    server: Arc<dyn ProtocolServer>,
    transport: Arc<HttpTransport>,
    pool_key: String,
    #[allow(dead_code)]
    created_at: Instant,
    last_accessed: Instant,
    active_requests: u32,
    is_closing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub total: usize,
    pub stale: usize,
}

pub struct McpSessionManager {
    sessions: Mutex<HashMap<String, McpSession>>,
    stale_timeout: Duration,
    cleanup_interval: Duration,
}

impl Default for McpSessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TIMEOUT, DEFAULT_CLEANUP_INTERVAL)
    }
}

impl McpSessionManager {
    pub fn new(stale_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            stale_timeout,
            cleanup_interval,
        }
    }

    /// Mints a session id, builds the transport that will emit it,
    /// couples the server to it and registers the triple.
    ///
    /// The transport's close hook funnels back into [`close`](Self::close)
    /// so a transport-initiated close and an explicit close converge on
    /// the same single teardown.
    pub fn create(
        self: &Arc<Self>,
        server: Arc<dyn ProtocolServer>,
        pool_key: &str,
    ) -> (String, Arc<HttpTransport>) {
        let id = Uuid::new_v4().to_string();
        let transport = HttpTransport::for_session(&id);

        let manager: Weak<McpSessionManager> = Arc::downgrade(self);
        let hook_id = id.clone();
        transport.set_close_hook(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                let id = hook_id;
                tokio::spawn(async move {
                    manager.close(&id).await;
                });
            }
        }));

        transport.connect(server.clone());

        let now = Instant::now();
        self.sessions.lock().expect("session map lock").insert(
            id.clone(),
            McpSession {
                server,
                transport: transport.clone(),
                pool_key: pool_key.to_string(),
                created_at: now,
                last_accessed: now,
                active_requests: 0,
                is_closing: false,
            },
        );

        tracing::info!(session_id = %id, pool_key, "MCP session created");
        (id, transport)
    }

    /// Returns the session's transport unless the session is absent or
    /// on its way out. Touches the idle clock.
    pub fn get(&self, id: &str) -> Option<Arc<HttpTransport>> {
        let mut sessions = self.sessions.lock().expect("session map lock");
        let session = sessions.get_mut(id)?;
        if session.is_closing {
            return None;
        }
        session.last_accessed = Instant::now();
        Some(session.transport.clone())
    }

    /// Marks one request in flight for `id`.
    pub fn begin(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session map lock");
        match sessions.get_mut(id) {
            Some(session) if !session.is_closing => {
                session.active_requests += 1;
                session.last_accessed = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Marks one request finished. Runs on every exit path, so it must
    /// tolerate a session that disappeared mid-request.
    pub fn end(&self, id: &str) {
        let mut sessions = self.sessions.lock().expect("session map lock");
        if let Some(session) = sessions.get_mut(id) {
            session.active_requests = session.active_requests.saturating_sub(1);
            session.last_accessed = Instant::now();
        }
    }

    /// Current in-flight count, if the session exists.
    pub fn active_requests(&self, id: &str) -> Option<u32> {
        let sessions = self.sessions.lock().expect("session map lock");
        sessions.get(id).map(|s| s.active_requests)
    }

    pub fn pool_key(&self, id: &str) -> Option<String> {
        let sessions = self.sessions.lock().expect("session map lock");
        sessions.get(id).map(|s| s.pool_key.clone())
    }

    /// Tears the session down. Returns false when the session is absent
    /// or another caller is already closing it.
    pub async fn close(&self, id: &str) -> bool {
        let (server, transport) = {
            let mut sessions = self.sessions.lock().expect("session map lock");
            match sessions.get_mut(id) {
                None => return false,
                Some(session) if session.is_closing => return false,
                Some(session) => {
                    session.is_closing = true;
                    (session.server.clone(), session.transport.clone())
                }
            }
        };

        transport.close();
        if let Err(e) = server.close().await {
            tracing::warn!(session_id = %id, error = %e, "error closing protocol server");
        }

        self.sessions.lock().expect("session map lock").remove(id);
        tracing::info!(session_id = %id, "MCP session closed");
        true
    }

    /// Closes every session bound to `pool_key`; used when a token dies.
    pub async fn close_by_pool_key(&self, pool_key: &str) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("session map lock");
            sessions
                .iter()
                .filter(|(_, s)| s.pool_key == pool_key && !s.is_closing)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let sessions = self.sessions.lock().expect("session map lock");
        let total = sessions.len();
        let stale = sessions
            .values()
            .filter(|s| now.duration_since(s.last_accessed) > self.stale_timeout)
            .count();
        SessionStats { total, stale }
    }

    /// Evicts idle sessions. A session with requests in flight is never
    /// evicted regardless of its idle clock.
    pub async fn sweep_stale(&self) {
        let now = Instant::now();
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().expect("session map lock");
            sessions
                .iter()
                .filter(|(_, s)| {
                    !s.is_closing
                        && s.active_requests == 0
                        && now.duration_since(s.last_accessed) > self.stale_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in stale {
            tracing::info!(session_id = %id, "evicting idle MCP session");
            self.close(&id).await;
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.sweep_stale().await,
                }
            }
        })
    }

    /// Closes every remaining session. Shutdown only.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("session map lock");
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.close(&id).await;
        }
    }
}
