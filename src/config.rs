//! Environment-driven configuration
//!
//! Everything the gateway reads from the environment is loaded once at
//! startup into a [`ServerConfig`]. Configuration errors are fatal; the
//! binary exits with code 1 before binding anything.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVar(&'static str),

    #[error("{name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    UnreadableFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid database host: {0}")]
    InvalidHost(String),

    #[error("TLS is enabled but {0} does not exist")]
    TlsMaterialMissing(String),
}

/// Immutable connection parameters for one database identity.
///
/// The password never appears in log output; `Debug` masks it.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub schema: Option<String>,
    pub options: HashMap<String, String>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Http,
    Both,
}

impl TransportMode {
    pub fn serves_http(self) -> bool {
        matches!(self, TransportMode::Http | TransportMode::Both)
    }

    pub fn serves_stdio(self) -> bool {
        matches!(self, TransportMode::Stdio | TransportMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Stateful,
    Stateless,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Stateful => "stateful",
            SessionMode::Stateless => "stateless",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    Token,
    None,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Required => "required",
            AuthMode::Token => "token",
            AuthMode::None => "none",
        }
    }
}

/// Which key the request rate limiter buckets by.
///
/// The default is a single process-wide bucket, matching the original
/// behaviour; `ip` and `token` are opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKey {
    Global,
    Ip,
    Token,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 900_000,
            max_requests: 100,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub default_limit: i64,
    pub max_limit: i64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub transport: TransportMode,
    pub http_host: String,
    pub http_port: u16,
    pub session_mode: SessionMode,
    pub max_sessions: usize,
    pub token_expiry_secs: u64,
    pub auth_mode: AuthMode,
    pub static_token: Option<String>,
    pub tls: TlsConfig,
    pub cors_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub rate_limit_by: RateLimitKey,
    pub query_limits: QueryLimits,
    pub trust_proxy: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = load_database_config()?;

        let transport = match env_or("MCP_TRANSPORT", "stdio").as_str() {
            "stdio" => TransportMode::Stdio,
            "http" => TransportMode::Http,
            "both" => TransportMode::Both,
            other => {
                return Err(ConfigError::InvalidVar {
                    name: "MCP_TRANSPORT",
                    reason: format!("expected stdio, http or both, got {other:?}"),
                })
            }
        };

        let session_mode = match env_or("MCP_SESSION_MODE", "stateful").as_str() {
            "stateful" => SessionMode::Stateful,
            "stateless" => SessionMode::Stateless,
            other => {
                return Err(ConfigError::InvalidVar {
                    name: "MCP_SESSION_MODE",
                    reason: format!("expected stateful or stateless, got {other:?}"),
                })
            }
        };

        let auth_mode = match env_or("MCP_AUTH_MODE", "required").as_str() {
            "required" => AuthMode::Required,
            "token" => AuthMode::Token,
            "none" => AuthMode::None,
            other => {
                return Err(ConfigError::InvalidVar {
                    name: "MCP_AUTH_MODE",
                    reason: format!("expected required, token or none, got {other:?}"),
                })
            }
        };

        let static_token = env::var("MCP_AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        if auth_mode == AuthMode::Token && static_token.is_none() {
            return Err(ConfigError::MissingVar("MCP_AUTH_TOKEN"));
        }

        let tls = load_tls_config()?;

        let cors_origins = env::var("MCP_CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let rate_limit = RateLimitConfig {
            window_ms: parse_env("RATE_LIMIT_WINDOW_MS", 900_000)?,
            max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            enabled: env_flag_enabled("RATE_LIMIT_ENABLED", true),
        };

        let rate_limit_by = match env_or("RATE_LIMIT_BY", "global").as_str() {
            "global" => RateLimitKey::Global,
            "ip" => RateLimitKey::Ip,
            "token" => RateLimitKey::Token,
            other => {
                return Err(ConfigError::InvalidVar {
                    name: "RATE_LIMIT_BY",
                    reason: format!("expected global, ip or token, got {other:?}"),
                })
            }
        };

        Ok(Self {
            database,
            transport,
            http_host: env_or("MCP_HTTP_HOST", "127.0.0.1"),
            http_port: parse_env("MCP_HTTP_PORT", 3000)?,
            session_mode,
            max_sessions: parse_env("MCP_MAX_SESSIONS", 100)?,
            token_expiry_secs: parse_env("MCP_TOKEN_EXPIRY", 3600)?,
            auth_mode,
            static_token,
            tls,
            cors_origins,
            rate_limit,
            rate_limit_by,
            query_limits: QueryLimits {
                default_limit: parse_env("QUERY_DEFAULT_LIMIT", 1000)?,
                max_limit: parse_env("QUERY_MAX_LIMIT", 10_000)?,
            },
            trust_proxy: env_flag_enabled("MCP_TRUST_PROXY", false),
        })
    }

    /// Effective base URL for the OpenAPI document and log banners.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls.enabled { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.http_host, self.http_port)
    }
}

fn load_database_config() -> Result<DatabaseConfig, ConfigError> {
    let host = env::var("DB_HOST").map_err(|_| ConfigError::MissingVar("DB_HOST"))?;
    if !is_valid_host(&host) {
        return Err(ConfigError::InvalidHost(host));
    }

    let username = env_or_file("DB_USER", "DB_USER_FILE")?
        .ok_or(ConfigError::MissingVar("DB_USER or DB_USER_FILE"))?;
    let password = env_or_file("DB_PASSWORD", "DB_PASSWORD_FILE")?
        .ok_or(ConfigError::MissingVar("DB_PASSWORD or DB_PASSWORD_FILE"))?;

    Ok(DatabaseConfig {
        host,
        port: parse_env("DB_PORT", 446).and_then(|p: u16| {
            if p == 0 {
                Err(ConfigError::InvalidVar {
                    name: "DB_PORT",
                    reason: "port must be between 1 and 65535".to_string(),
                })
            } else {
                Ok(p)
            }
        })?,
        username,
        password,
        database: env_or("DB_DATABASE", "*LOCAL"),
        schema: env::var("DB_SCHEMA").ok().filter(|s| !s.is_empty()),
        options: parse_driver_options(&env::var("DB_OPTIONS").unwrap_or_default()),
    })
}

fn load_tls_config() -> Result<TlsConfig, ConfigError> {
    let enabled = env_flag_enabled("MCP_TLS_ENABLED", false);
    let cert_path = env::var("MCP_TLS_CERT_PATH").ok().map(PathBuf::from);
    let key_path = env::var("MCP_TLS_KEY_PATH").ok().map(PathBuf::from);

    if enabled {
        for (name, path) in [
            ("MCP_TLS_CERT_PATH", &cert_path),
            ("MCP_TLS_KEY_PATH", &key_path),
        ] {
            match path {
                None => return Err(ConfigError::MissingVar(name)),
                Some(p) if !p.exists() => {
                    return Err(ConfigError::TlsMaterialMissing(p.display().to_string()))
                }
                Some(_) => {}
            }
        }
    }

    Ok(TlsConfig {
        enabled,
        cert_path,
        key_path,
    })
}

/// Parse `DB_OPTIONS` of the form `key=value,key2=value2` into a map.
fn parse_driver_options(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62})?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62})?)*$")
        .expect("hostname regex")
});

/// Accepts RFC 1123 hostnames and dotted-quad IPv4 addresses.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return true;
    }
    // Reject things that look numeric but are not valid IPv4 (e.g. 300.1.2.3)
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    HOSTNAME_RE.is_match(host)
}

/// Validates an optional client-supplied port (the `/auth` body field).
pub fn is_valid_port(port: i64) -> bool {
    (1..=65_535).contains(&port)
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// `FOO_FILE` takes precedence over `FOO`; both absent yields `None`.
fn env_or_file(name: &'static str, file_name: &'static str) -> Result<Option<String>, ConfigError> {
    if let Ok(path) = env::var(file_name) {
        let contents =
            std::fs::read_to_string(&path).map_err(|source| ConfigError::UnreadableFile {
                path,
                source,
            })?;
        return Ok(Some(contents.trim_end_matches(['\r', '\n']).to_string()));
    }
    Ok(env::var(name).ok().filter(|v| !v.is_empty()))
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Boolean knobs treat `"false"` and `"0"` as off; anything else set is on.
fn env_flag_enabled(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => !matches!(value.as_str(), "false" | "0" | "FALSE" | "False"),
        Err(_) => default,
    }
}
