//! Test doubles shared by unit and integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{
    AuthMode, DatabaseConfig, QueryLimits, RateLimitConfig, RateLimitKey, ServerConfig,
    SessionMode, TlsConfig, TransportMode,
};
use crate::db::{Database, DatabasePool, DbError};

/// Builds a [`DatabaseConfig`] with the given credentials and sane defaults.
pub fn database_config(username: &str, password: &str) -> DatabaseConfig {
    DatabaseConfig {
        host: "db.test".to_string(),
        port: 446,
        username: username.to_string(),
        password: password.to_string(),
        database: "*LOCAL".to_string(),
        schema: None,
        options: HashMap::new(),
    }
}

/// A [`ServerConfig`] for handler tests, bypassing the environment.
pub fn server_config(auth_mode: AuthMode, session_mode: SessionMode) -> ServerConfig {
    ServerConfig {
        database: database_config("svc", "secret"),
        transport: TransportMode::Http,
        http_host: "127.0.0.1".to_string(),
        http_port: 3000,
        session_mode,
        max_sessions: 100,
        token_expiry_secs: 3600,
        auth_mode,
        static_token: matches!(auth_mode, AuthMode::Token)
            .then(|| "static-test-token".to_string()),
        tls: TlsConfig {
            enabled: false,
            cert_path: None,
            key_path: None,
        },
        cors_origins: Vec::new(),
        rate_limit: RateLimitConfig {
            window_ms: 900_000,
            max_requests: 100,
            enabled: true,
        },
        rate_limit_by: RateLimitKey::Global,
        query_limits: QueryLimits {
            default_limit: 1000,
            max_limit: 10_000,
        },
        trust_proxy: false,
    }
}

/// Scriptable in-memory [`Database`].
///
/// `accept_all` opens a pool for any credentials; `with_credentials` only
/// for the expected pair, failing the probe path the way a real driver
/// fails a bad login. Every opened pool is retained so tests can assert on
/// close and probe counts.
pub struct MockDatabase {
    expected: Option<(String, String)>,
    opened: Mutex<Vec<Arc<MockPool>>>,
    fail_next_open: AtomicBool,
}

impl MockDatabase {
    pub fn accept_all() -> Self {
        Self {
            expected: None,
            opened: Mutex::new(Vec::new()),
            fail_next_open: AtomicBool::new(false),
        }
    }

    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            expected: Some((username.to_string(), password.to_string())),
            opened: Mutex::new(Vec::new()),
            fail_next_open: AtomicBool::new(false),
        }
    }

    /// Makes the next `open_pool` call fail with a connection error.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn opened_pools(&self) -> Vec<Arc<MockPool>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn open_pool(&self, config: &DatabaseConfig) -> Result<Arc<dyn DatabasePool>, DbError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(DbError::Connection("injected failure".to_string()));
        }

        if let Some((user, password)) = &self.expected {
            if &config.username != user || &config.password != password {
                return Err(DbError::Connection("login failed".to_string()));
            }
        }

        let pool = Arc::new(MockPool::new());
        self.opened.lock().unwrap().push(pool.clone());
        Ok(pool)
    }
}

pub struct MockPool {
    rows: Mutex<Vec<Value>>,
    probe_result: AtomicBool,
    probes: AtomicUsize,
    closes: AtomicUsize,
    executes: AtomicUsize,
}

impl MockPool {
    fn new() -> Self {
        Self {
            rows: Mutex::new(vec![json!({"ok": 1})]),
            probe_result: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
        }
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_probe_result(&self, ok: bool) {
        self.probe_result.store(ok, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl DatabasePool for MockPool {
    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Value>, DbError> {
        if self.is_closed() {
            return Err(DbError::Query("pool is closed".to_string()));
        }
        self.executes.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.probe_result.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DbError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
