//! Environment loading tests
//!
//! These mutate process environment variables, so they are serialised
//! and restore the previous values on drop.

use std::collections::HashMap;
use std::env;
use std::io::Write;

use serial_test::serial;

use dbmcp::config::{AuthMode, RateLimitKey, ServerConfig, SessionMode, TransportMode};

#[derive(Default)]
struct EnvGuard {
    original: HashMap<String, Option<String>>,
}

impl EnvGuard {
    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.original
            .entry(key.to_string())
            .or_insert_with(|| env::var(key).ok());
        env::set_var(key, value.into());
    }

    fn remove(&mut self, key: &str) {
        self.original
            .entry(key.to_string())
            .or_insert_with(|| env::var(key).ok());
        env::remove_var(key);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.original.drain() {
            match value {
                Some(v) => env::set_var(&key, v),
                None => env::remove_var(&key),
            }
        }
    }
}

fn minimal_env(guard: &mut EnvGuard) {
    guard.set("DB_HOST", "db.example.com");
    guard.set("DB_USER", "svc");
    guard.set("DB_PASSWORD", "secret");
    for key in [
        "DB_USER_FILE",
        "DB_PASSWORD_FILE",
        "DB_PORT",
        "DB_DATABASE",
        "DB_SCHEMA",
        "DB_OPTIONS",
        "MCP_TRANSPORT",
        "MCP_HTTP_PORT",
        "MCP_HTTP_HOST",
        "MCP_SESSION_MODE",
        "MCP_MAX_SESSIONS",
        "MCP_TOKEN_EXPIRY",
        "MCP_AUTH_MODE",
        "MCP_AUTH_TOKEN",
        "MCP_TLS_ENABLED",
        "MCP_CORS_ORIGINS",
        "RATE_LIMIT_WINDOW_MS",
        "RATE_LIMIT_MAX_REQUESTS",
        "RATE_LIMIT_ENABLED",
        "RATE_LIMIT_BY",
        "QUERY_DEFAULT_LIMIT",
        "QUERY_MAX_LIMIT",
        "MCP_TRUST_PROXY",
    ] {
        guard.remove(key);
    }
}

#[test]
#[serial]
fn defaults_are_the_documented_ones() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    let config = ServerConfig::from_env().unwrap();

    assert_eq!(config.database.host, "db.example.com");
    assert_eq!(config.database.port, 446);
    assert_eq!(config.database.database, "*LOCAL");
    assert_eq!(config.transport, TransportMode::Stdio);
    assert_eq!(config.http_port, 3000);
    assert_eq!(config.http_host, "127.0.0.1");
    assert_eq!(config.session_mode, SessionMode::Stateful);
    assert_eq!(config.max_sessions, 100);
    assert_eq!(config.token_expiry_secs, 3600);
    assert_eq!(config.auth_mode, AuthMode::Required);
    assert!(!config.tls.enabled);
    assert!(config.cors_origins.is_empty());
    assert_eq!(config.rate_limit.window_ms, 900_000);
    assert_eq!(config.rate_limit.max_requests, 100);
    assert!(config.rate_limit.enabled);
    assert_eq!(config.rate_limit_by, RateLimitKey::Global);
    assert_eq!(config.query_limits.default_limit, 1000);
    assert_eq!(config.query_limits.max_limit, 10_000);
    assert!(!config.trust_proxy);
}

#[test]
#[serial]
fn missing_required_vars_fail() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.remove("DB_HOST");
    assert!(ServerConfig::from_env().is_err());

    minimal_env(&mut guard);
    guard.remove("DB_PASSWORD");
    assert!(ServerConfig::from_env().is_err());
}

#[test]
#[serial]
fn file_valued_variants_take_precedence() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "from-file-password").unwrap();
    guard.set("DB_PASSWORD_FILE", file.path().to_str().unwrap());
    guard.set("DB_PASSWORD", "ignored");

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.database.password, "from-file-password");
}

#[test]
#[serial]
fn rate_limit_disable_accepts_false_and_zero() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.set("RATE_LIMIT_ENABLED", "false");
    assert!(!ServerConfig::from_env().unwrap().rate_limit.enabled);

    guard.set("RATE_LIMIT_ENABLED", "0");
    assert!(!ServerConfig::from_env().unwrap().rate_limit.enabled);

    guard.set("RATE_LIMIT_ENABLED", "true");
    assert!(ServerConfig::from_env().unwrap().rate_limit.enabled);
}

#[test]
#[serial]
fn token_mode_requires_the_static_token() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.set("MCP_AUTH_MODE", "token");
    assert!(ServerConfig::from_env().is_err());

    guard.set("MCP_AUTH_TOKEN", "pre-shared");
    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.auth_mode, AuthMode::Token);
    assert_eq!(config.static_token.as_deref(), Some("pre-shared"));
}

#[test]
#[serial]
fn tls_requires_existing_material() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.set("MCP_TLS_ENABLED", "true");
    assert!(ServerConfig::from_env().is_err());

    guard.set("MCP_TLS_CERT_PATH", "/nonexistent/cert.pem");
    guard.set("MCP_TLS_KEY_PATH", "/nonexistent/key.pem");
    assert!(ServerConfig::from_env().is_err());

    let cert = tempfile::NamedTempFile::new().unwrap();
    let key = tempfile::NamedTempFile::new().unwrap();
    guard.set("MCP_TLS_CERT_PATH", cert.path().to_str().unwrap());
    guard.set("MCP_TLS_KEY_PATH", key.path().to_str().unwrap());
    let config = ServerConfig::from_env().unwrap();
    assert!(config.tls.enabled);
}

#[test]
#[serial]
fn invalid_host_is_fatal() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.set("DB_HOST", "bad host name");
    assert!(ServerConfig::from_env().is_err());
}

#[test]
#[serial]
fn cors_origins_parse_as_a_list() {
    let mut guard = EnvGuard::default();
    minimal_env(&mut guard);

    guard.set(
        "MCP_CORS_ORIGINS",
        "https://a.example.com, https://b.example.com",
    );
    let config = ServerConfig::from_env().unwrap();
    assert_eq!(
        config.cors_origins,
        vec![
            "https://a.example.com".to_string(),
            "https://b.example.com".to_string()
        ]
    );
}
