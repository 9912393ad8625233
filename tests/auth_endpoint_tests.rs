//! Integration tests for the `/auth` endpoint
//!
//! Covers the credential probe, body validation, the brute-force
//! throttle, the concurrent session cap, and the expiry cascade from
//! token death down to pool closure.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use futures::future::join_all;
use serde_json::{json, Value};
use tower::ServiceExt;

use dbmcp::config::{AuthMode, ServerConfig, SessionMode};
use dbmcp::handlers;
use dbmcp::test_utils::{server_config, MockDatabase};
use dbmcp::AppState;

fn app_with(config: ServerConfig) -> (Router, AppState, Arc<MockDatabase>) {
    let database = Arc::new(MockDatabase::with_credentials("svc", "secret"));
    let state = AppState::new(config, database.clone());
    (handlers::router(state.clone()), state, database)
}

fn required_app() -> (Router, AppState, Arc<MockDatabase>) {
    app_with(server_config(AuthMode::Required, SessionMode::Stateful))
}

async fn post_json(
    app: &Router,
    uri: &str,
    body: &Value,
    bearer: Option<&str>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, value)
}

fn credentials() -> Value {
    json!({"username": "svc", "password": "secret"})
}

#[tokio::test]
async fn valid_credentials_mint_a_token() {
    let (app, state, database) = required_app();

    let (status, _, body) = post_json(&app, "/auth", &credentials(), None).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);
    assert!(body["expires_at"].as_str().unwrap().contains('T'));
    let token = body["access_token"].as_str().unwrap();
    assert!(token.len() >= 43);

    assert_eq!(state.tokens.size(), 1);

    // The credential probe used a transient pool and closed it.
    let pools = database.opened_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].probe_count(), 1);
    assert_eq!(pools[0].close_count(), 1);
}

#[tokio::test]
async fn wrong_password_is_401_with_oauth_body() {
    let (app, state, _) = required_app();

    let body = json!({"username": "svc", "password": "nope"});
    let (status, _, response) = post_json(&app, "/auth", &body, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "invalid_credentials");
    assert!(response["error_description"].is_string());
    assert_eq!(state.tokens.size(), 0);
}

#[tokio::test]
async fn malformed_bodies_are_400() {
    let (app, _, _) = required_app();

    for body in [
        json!({"password": "secret"}),
        json!({"username": "", "password": "secret"}),
        json!({"username": "svc", "password": "secret", "port": 99999}),
        json!({"username": "svc", "password": "secret", "duration": 0}),
        json!({"username": "svc", "password": "secret", "host": "no spaces allowed"}),
    ] {
        let (status, _, response) = post_json(&app, "/auth", &body, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "for body {body}");
        assert_eq!(response["error"], "invalid_request");
    }
}

#[tokio::test]
async fn auth_is_404_outside_required_mode() {
    for mode in [AuthMode::Token, AuthMode::None] {
        let (app, _, _) = app_with(server_config(mode, SessionMode::Stateful));
        let (status, _, response) = post_json(&app, "/auth", &credentials(), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(response["error"], "not_found");
    }
}

// Scenario: session-cap race. Ten concurrent /auth calls against a cap
// of two must produce exactly two tokens.
#[tokio::test]
async fn session_cap_holds_under_concurrent_auth() {
    let mut config = server_config(AuthMode::Required, SessionMode::Stateful);
    config.max_sessions = 2;
    let (app, state, _) = app_with(config);

    let calls = (0..10).map(|_| {
        let app = app.clone();
        async move { post_json(&app, "/auth", &credentials(), None).await.0 }
    });
    let statuses = join_all(calls).await;

    let created = statuses
        .iter()
        .filter(|s| **s == StatusCode::CREATED)
        .count();
    let rejected = statuses
        .iter()
        .filter(|s| **s == StatusCode::SERVICE_UNAVAILABLE)
        .count();

    assert_eq!(created, 2);
    assert_eq!(rejected, 8);
    assert_eq!(state.tokens.size(), 2);
}

// Scenario: brute-force lockout. Five failures trip the throttle; the
// sixth call is refused before touching the database.
#[tokio::test]
async fn brute_force_is_throttled_with_retry_after() {
    let (app, _, database) = required_app();
    let bad = json!({"username": "svc", "password": "wrong"});

    for _ in 0..5 {
        let (status, _, _) = post_json(&app, "/auth", &bad, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let probes_before = database.opened_count();

    let (status, headers, response) = post_json(&app, "/auth", &bad, None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response["error"], "too_many_requests");
    let retry_after = response["retry_after"].as_u64().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    assert!(headers.contains_key(header::RETRY_AFTER));

    // The throttled call never reached the credential probe.
    assert_eq!(database.opened_count(), probes_before);
}

#[tokio::test]
async fn successful_auth_clears_failure_history() {
    let (app, _, _) = required_app();
    let bad = json!({"username": "svc", "password": "wrong"});

    for _ in 0..3 {
        post_json(&app, "/auth", &bad, None).await;
    }
    let (status, _, _) = post_json(&app, "/auth", &credentials(), None).await;
    assert_eq!(status, StatusCode::CREATED);

    // History is gone: four more failures still stay under the limit.
    for _ in 0..4 {
        let (status, _, _) = post_json(&app, "/auth", &bad, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}

// Scenario: token expiry cascade. A one-second token dies, its pool is
// closed exactly once, and the old bearer is refused afterwards.
#[tokio::test]
async fn token_expiry_cascades_to_pool_closure() {
    let (app, state, database) = required_app();

    let body = json!({"username": "svc", "password": "secret", "duration": 1});
    let (status, _, response) = post_json(&app, "/auth", &body, None).await;
    assert_eq!(status, StatusCode::CREATED);
    let token = response["access_token"].as_str().unwrap().to_string();

    // Open the per-token pool by initializing a session.
    let init = json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1});
    let (status, _, _) = post_json(&app, "/mcp", &init, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.sessions.stats().total, 1);

    let pools = database.opened_pools();
    assert_eq!(pools.len(), 2); // probe pool + per-token pool
    let token_pool = pools[1].clone();
    assert_eq!(token_pool.close_count(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    // Validation observes the expiry and fires the cascade.
    let ping = json!({"jsonrpc": "2.0", "method": "ping", "id": 2});
    let (status, _, response) = post_json(&app, "/mcp", &ping, Some(&token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "invalid_token");

    assert_eq!(state.tokens.size(), 0);
    assert_eq!(token_pool.close_count(), 1);
    assert_eq!(state.sessions.stats().total, 0);

    // The dead bearer stays dead.
    let (status, _, _) = post_json(&app, "/mcp", &ping, Some(&token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(token_pool.close_count(), 1);
}

#[tokio::test]
async fn revocation_through_shutdown_closes_per_token_pools_once() {
    let (app, state, database) = required_app();

    let (_, _, response) = post_json(&app, "/auth", &credentials(), None).await;
    let token = response["access_token"].as_str().unwrap().to_string();

    let init = json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1});
    post_json(&app, "/mcp", &init, Some(&token)).await;

    let token_pool = database.opened_pools()[1].clone();

    // Shutdown drains sessions, then tokens (closing per-token pools),
    // then the registry; nothing may double-close.
    state.sessions.shutdown().await;
    state.tokens.shutdown().await;
    state.pools.close_all().await;

    assert_eq!(token_pool.close_count(), 1);
    assert_eq!(state.tokens.size(), 0);
}
