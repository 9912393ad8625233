//! HTTP surface and per-request routing
//!
//! `/health` and `/openapi.json` are open; `/auth` runs its own throttle;
//! `/mcp` sits behind the rate limiter and the per-mode auth middleware.
//! The POST handler is the request router: it picks the pool for the
//! caller's auth mode and drives the stateful or stateless session flow.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthContext};
use crate::config::{AuthMode, DatabaseConfig, SessionMode};
use crate::db::GLOBAL_POOL_KEY;
use crate::error::{
    rpc_error_response, RPC_BAD_REQUEST, RPC_INTERNAL_ERROR, RPC_PARSE_ERROR,
    RPC_SESSION_NOT_FOUND,
};
use crate::mcp::server::{SERVER_NAME, SERVER_VERSION};
use crate::mcp::{GatewayServer, HttpTransport, McpSessionManager};
use crate::middleware as mw;
use crate::AppState;

const SESSION_HEADER: &str = "mcp-session-id";
const MAX_MCP_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Builds the complete HTTP application.
pub fn router(state: AppState) -> Router {
    let mcp_routes = Router::new()
        .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
        .route_layer(from_fn_with_state(state.clone(), auth::require_auth))
        .route_layer(from_fn_with_state(state.clone(), mw::rate_limit));

    Router::new()
        .route("/health", get(health_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/auth", post(auth::auth_handler))
        .merge(mcp_routes)
        .layer(from_fn_with_state(state.clone(), mw::cors))
        .layer(from_fn(mw::security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// /health and /openapi.json
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let mcp_stats = state.sessions.stats();

    let mut sessions = json!({ "mcp": mcp_stats.total });
    if state.config.auth_mode == AuthMode::Required {
        sessions["tokens"] = json!(state.tokens.stats().active);
    }

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "server": { "name": SERVER_NAME, "version": SERVER_VERSION },
        "config": {
            "authMode": state.config.auth_mode.as_str(),
            "sessionMode": state.config.session_mode.as_str(),
            "tlsEnabled": state.config.tls.enabled,
        },
        "sessions": sessions,
    }))
}

async fn openapi_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": SERVER_NAME,
            "version": SERVER_VERSION,
            "description": "MCP gateway exposing read-only database tools",
        },
        "servers": [{ "url": state.config.base_url() }],
        "paths": {
            "/health": {
                "get": { "summary": "Liveness and configuration summary" }
            },
            "/auth": {
                "post": {
                    "summary": "Exchange database credentials for a bearer token",
                    "requestBody": {
                        "content": { "application/json": { "schema": {
                            "type": "object",
                            "required": ["username", "password"],
                            "properties": {
                                "username": { "type": "string" },
                                "password": { "type": "string" },
                                "host": { "type": "string" },
                                "port": { "type": "integer", "minimum": 1, "maximum": 65535 },
                                "database": { "type": "string" },
                                "schema": { "type": "string" },
                                "duration": { "type": "integer", "minimum": 1, "maximum": 86400 }
                            }
                        } } }
                    }
                }
            },
            "/mcp": {
                "post": { "summary": "MCP JSON-RPC endpoint" },
                "get": { "summary": "Server-sent event stream for a session" },
                "delete": { "summary": "Close a session" }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// /mcp
// ---------------------------------------------------------------------------

/// Runs `end` on every exit path of a dispatched request.
struct EndGuard {
    sessions: Arc<McpSessionManager>,
    id: String,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.sessions.end(&self.id);
    }
}

fn request_id(body: &Value) -> Value {
    body.get("id").cloned().unwrap_or(Value::Null)
}

fn is_initialize(body: &Value) -> bool {
    body.get("method").and_then(Value::as_str) == Some("initialize")
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `(config, poolKey, token)` for the caller's auth mode.
fn route_for(state: &AppState, auth: &AuthContext) -> (Arc<DatabaseConfig>, String, Option<String>) {
    match auth {
        AuthContext::Session(session) => (
            session.config.clone(),
            session.token.clone(),
            Some(session.token.clone()),
        ),
        AuthContext::Anonymous | AuthContext::StaticToken => (
            Arc::new(state.config.database.clone()),
            GLOBAL_POOL_KEY.to_string(),
            None,
        ),
    }
}

async fn mcp_post(State(state): State<AppState>, request: Request) -> Response {
    let Some(auth) = request.extensions().get::<AuthContext>().cloned() else {
        return rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Value::Null,
            RPC_INTERNAL_ERROR,
            "authentication context missing",
        );
    };
    let session_id = session_header(request.headers());

    let bytes = match axum::body::to_bytes(request.into_body(), MAX_MCP_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                Value::Null,
                RPC_BAD_REQUEST,
                "request body too large",
            )
        }
    };
    let body: Value = match serde_json::from_slice(&bytes) {
        Ok(body) => body,
        Err(_) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                Value::Null,
                RPC_PARSE_ERROR,
                "Parse error",
            )
        }
    };

    let (config, pool_key, token) = route_for(&state, &auth);

    match state.config.session_mode {
        SessionMode::Stateful => {
            stateful_post(&state, session_id, body, config, &pool_key, token).await
        }
        SessionMode::Stateless => stateless_post(&state, body, config, &pool_key).await,
    }
}

async fn stateful_post(
    state: &AppState,
    session_id: Option<String>,
    body: Value,
    config: Arc<DatabaseConfig>,
    pool_key: &str,
    token: Option<String>,
) -> Response {
    // Existing session: account the request and dispatch.
    if let Some(sid) = session_id {
        let Some(transport) = state.sessions.get(&sid) else {
            return rpc_error_response(
                StatusCode::NOT_FOUND,
                request_id(&body),
                RPC_SESSION_NOT_FOUND,
                "Session not found or expired",
            );
        };

        if !state.sessions.begin(&sid) {
            return rpc_error_response(
                StatusCode::NOT_FOUND,
                request_id(&body),
                RPC_SESSION_NOT_FOUND,
                "Session not found or expired",
            );
        }
        let _guard = EndGuard {
            sessions: state.sessions.clone(),
            id: sid.clone(),
        };

        let id = request_id(&body);
        return match transport.handle_request(body).await {
            Ok(Some(response)) => {
                with_session_header((StatusCode::OK, Json(response)).into_response(), &sid)
            }
            Ok(None) => with_session_header(StatusCode::ACCEPTED.into_response(), &sid),
            Err(e) => {
                tracing::warn!(session_id = %sid, error = %e, "dispatch failed");
                rpc_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    id,
                    RPC_INTERNAL_ERROR,
                    "Internal error",
                )
            }
        };
    }

    // No session yet: only initialize may open one.
    if !is_initialize(&body) {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            request_id(&body),
            RPC_BAD_REQUEST,
            "Session ID required for non-initialize requests",
        );
    }

    if let Err(e) = state.pools.ensure(pool_key, &config).await {
        tracing::error!(error = %e, "failed to open database pool");
        return rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            request_id(&body),
            RPC_INTERNAL_ERROR,
            "failed to open database pool",
        );
    }

    let server = GatewayServer::create(state.pools.clone(), pool_key, state.config.query_limits);
    let (sid, transport) = state.sessions.create(server, pool_key);

    if let Some(token) = &token {
        state.tokens.attach(token, &sid);
    }

    let id = request_id(&body);
    match transport.handle_request(body).await {
        Ok(Some(response)) => {
            with_session_header((StatusCode::OK, Json(response)).into_response(), &sid)
        }
        other => {
            if let Err(e) = &other {
                tracing::error!(session_id = %sid, error = %e, "initialize dispatch failed");
            }
            // Roll back in inverse creation order: the session teardown
            // closes server and transport; the pool goes last, and only
            // when it is not the shared one.
            state.sessions.close(&sid).await;
            if pool_key != GLOBAL_POOL_KEY {
                state.pools.close(pool_key).await;
            }
            rpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                id,
                RPC_INTERNAL_ERROR,
                "initialization failed",
            )
        }
    }
}

async fn stateless_post(
    state: &AppState,
    body: Value,
    config: Arc<DatabaseConfig>,
    pool_key: &str,
) -> Response {
    if let Err(e) = state.pools.ensure(pool_key, &config).await {
        tracing::error!(error = %e, "failed to open database pool");
        return rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            request_id(&body),
            RPC_INTERNAL_ERROR,
            "failed to open database pool",
        );
    }

    let server = GatewayServer::create(state.pools.clone(), pool_key, state.config.query_limits);
    let transport = HttpTransport::one_shot();
    transport.connect(server.clone());

    let id = request_id(&body);
    let result = transport.handle_request(body).await;

    // One-shot teardown: server and transport die with the response. The
    // pool stays; it belongs to the token or to the process.
    if let Err(e) = server.close().await {
        tracing::warn!(error = %e, "error closing one-shot server");
    }
    transport.close();

    match result {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "stateless dispatch failed");
            rpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                id,
                RPC_INTERNAL_ERROR,
                "Internal error",
            )
        }
    }
}

async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.config.session_mode == SessionMode::Stateless {
        return rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            Value::Null,
            RPC_BAD_REQUEST,
            "SSE streams are not available in stateless mode",
        );
    }

    let Some(sid) = session_header(&headers) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            Value::Null,
            RPC_BAD_REQUEST,
            "Session ID required",
        );
    };

    let Some(transport) = state.sessions.get(&sid) else {
        return rpc_error_response(
            StatusCode::NOT_FOUND,
            Value::Null,
            RPC_SESSION_NOT_FOUND,
            "Session not found or expired",
        );
    };

    let stream = ReceiverStream::new(transport.subscribe())
        .map(|message| Ok::<Event, Infallible>(Event::default().data(message.to_string())));

    let response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    with_session_header(response, &sid)
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.config.session_mode == SessionMode::Stateless {
        return rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            Value::Null,
            RPC_BAD_REQUEST,
            "there are no sessions to close in stateless mode",
        );
    }

    let Some(sid) = session_header(&headers) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            Value::Null,
            RPC_BAD_REQUEST,
            "Session ID required",
        );
    };

    if !state.sessions.close(&sid).await {
        return rpc_error_response(
            StatusCode::NOT_FOUND,
            Value::Null,
            RPC_SESSION_NOT_FOUND,
            "Session not found or expired",
        );
    }

    Json(json!({ "status": "session_closed", "sessionId": sid })).into_response()
}
