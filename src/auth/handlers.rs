//! The `/auth` credential-exchange endpoint
//!
//! Exchanges database credentials for a bearer token after probing that
//! the credentials can actually open a connection. Every failure path
//! feeds the per-IP throttle; a success clears it.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{is_valid_host, is_valid_port, AuthMode, DatabaseConfig};
use crate::error::ApiError;
use crate::middleware::client_ip_from_request;
use crate::services::TokenError;
use crate::AppState;

const MAX_AUTH_BODY_BYTES: usize = 64 * 1024;

/// Successful token grant, RFC 6749 shaped.
#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    expires_at: String,
}

/// Validated `/auth` request body.
struct AuthRequest {
    username: String,
    password: String,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    schema: Option<String>,
    duration: Option<u64>,
}

pub async fn auth_handler(State(state): State<AppState>, request: Request) -> Response {
    match state.config.auth_mode {
        AuthMode::Required => {}
        AuthMode::Token => {
            return not_found_for_mode("authentication uses the pre-shared MCP_AUTH_TOKEN")
        }
        AuthMode::None => return not_found_for_mode("authentication is disabled"),
    }

    let ip = client_ip_from_request(&request, state.config.trust_proxy);

    // 1. Brute-force throttle.
    if let Err(retry_after_secs) = state.auth_throttle.check(&ip) {
        tracing::warn!(%ip, "auth throttled");
        return ApiError::Throttled { retry_after_secs }.into_response();
    }

    match authenticate(&state, request).await {
        Ok(created) => {
            // 7. Success wipes this IP's failure history.
            state.auth_throttle.clear(&ip);
            (
                StatusCode::CREATED,
                Json(TokenResponse {
                    access_token: created.token,
                    token_type: "Bearer",
                    expires_in: created.expires_in,
                    expires_at: created.expires_at.to_rfc3339(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            if matches!(
                err,
                ApiError::Validation(_) | ApiError::InvalidCredentials
            ) {
                state.auth_throttle.record_failure(&ip);
            }
            err.into_response()
        }
    }
}

async fn authenticate(
    state: &AppState,
    request: Request,
) -> Result<crate::services::CreatedToken, ApiError> {
    // 2. Body validation.
    let body = read_json_body(request).await?;
    let fields = validate_auth_request(&body).map_err(ApiError::Validation)?;

    // 3. Merge with environment defaults and re-check the hostname.
    let defaults = &state.config.database;
    let config = DatabaseConfig {
        host: fields.host.unwrap_or_else(|| defaults.host.clone()),
        port: fields.port.unwrap_or(defaults.port),
        username: fields.username,
        password: fields.password,
        database: fields.database.unwrap_or_else(|| defaults.database.clone()),
        schema: fields.schema.or_else(|| defaults.schema.clone()),
        options: defaults.options.clone(),
    };
    if !is_valid_host(&config.host) {
        return Err(ApiError::Validation(format!(
            "invalid host: {}",
            config.host
        )));
    }

    // 4. Credential probe on a single-use pool. The key is random so
    // concurrent probes never collide; the token does not exist yet.
    let probe_key = format!("probe-{}", Uuid::new_v4());
    let probe_ok = match state.pools.ensure(&probe_key, &config).await {
        Ok(()) => state.pools.test(&probe_key).await,
        Err(e) => {
            tracing::debug!(error = %e, "credential probe failed to connect");
            false
        }
    };
    state.pools.close(&probe_key).await;
    if !probe_ok {
        return Err(ApiError::InvalidCredentials);
    }

    // 5. Advisory capacity check, so full capacity reads as 503 and not
    // as a create() failure.
    if !state.tokens.can_create() {
        return Err(ApiError::SessionLimit(
            "Maximum concurrent sessions reached".to_string(),
        ));
    }

    // 6. Atomic admission; a racing create can still lose here.
    state
        .tokens
        .create(Arc::new(config), fields.duration)
        .map_err(|e| match e {
            TokenError::SessionLimit => ApiError::SessionLimit(e.to_string()),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        })
}

async fn read_json_body(request: Request) -> Result<Value, ApiError> {
    let body = axum::body::to_bytes(request.into_body(), MAX_AUTH_BODY_BYTES)
        .await
        .map_err(|_| ApiError::Validation("request body too large".to_string()))?;
    serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("request body must be JSON".to_string()))
}

fn validate_auth_request(body: &Value) -> Result<AuthRequest, String> {
    let object = body.as_object().ok_or("request body must be an object")?;

    let username = match object.get("username") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err("username must be a non-empty string".to_string()),
    };
    let password = match object.get("password") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err("password must be a string".to_string()),
    };

    let host = match object.get("host") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => return Err("host must be a non-empty string".to_string()),
    };

    let port = match object.get("port") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(p) if is_valid_port(p) => Some(p as u16),
            _ => return Err("port must be an integer between 1 and 65535".to_string()),
        },
        _ => return Err("port must be an integer between 1 and 65535".to_string()),
    };

    let database = optional_string(object, "database")?;
    let schema = optional_string(object, "schema")?;

    let duration = match object.get("duration") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(d) if (1..=86_400).contains(&d) => Some(d as u64),
            _ => return Err("duration must be an integer between 1 and 86400".to_string()),
        },
        _ => return Err("duration must be an integer between 1 and 86400".to_string()),
    };

    Ok(AuthRequest {
        username,
        password,
        host,
        port,
        database,
        schema,
        duration,
    })
}

fn optional_string(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<String>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        _ => Err(format!("{key} must be a string")),
    }
}

fn not_found_for_mode(explanation: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "error_description": format!("/auth is not available: {explanation}"),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_valid_body() {
        let body = json!({"username": "svc", "password": "secret"});
        let fields = validate_auth_request(&body).unwrap();
        assert_eq!(fields.username, "svc");
        assert!(fields.host.is_none());
        assert!(fields.duration.is_none());
    }

    #[test]
    fn full_body_roundtrips() {
        let body = json!({
            "username": "svc",
            "password": "secret",
            "host": "db.example.com",
            "port": 50000,
            "database": "SAMPLE",
            "schema": "SALES",
            "duration": 600,
        });
        let fields = validate_auth_request(&body).unwrap();
        assert_eq!(fields.port, Some(50_000));
        assert_eq!(fields.duration, Some(600));
        assert_eq!(fields.schema.as_deref(), Some("SALES"));
    }

    #[test]
    fn rejects_bad_fields() {
        for body in [
            json!([1, 2, 3]),
            json!({"password": "x"}),
            json!({"username": "", "password": "x"}),
            json!({"username": "svc"}),
            json!({"username": "svc", "password": 42}),
            json!({"username": "svc", "password": "x", "port": 0}),
            json!({"username": "svc", "password": "x", "port": 70000}),
            json!({"username": "svc", "password": "x", "port": "446"}),
            json!({"username": "svc", "password": "x", "host": ""}),
            json!({"username": "svc", "password": "x", "duration": 0}),
            json!({"username": "svc", "password": "x", "duration": 100000}),
        ] {
            assert!(validate_auth_request(&body).is_err(), "should reject {body}");
        }
    }
}
