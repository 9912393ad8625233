use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use thiserror::Error;

/// JSON-RPC error codes used on the MCP endpoint.
///
/// `-32000..-32099` is the reserved server range; the gateway uses the
/// first two slots for its own conditions.
pub const RPC_BAD_REQUEST: i64 = -32000;
pub const RPC_SESSION_NOT_FOUND: i64 = -32001;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_INVALID_PARAMS: i64 = -32602;
pub const RPC_INTERNAL_ERROR: i64 = -32603;
pub const RPC_PARSE_ERROR: i64 = -32700;

/// Build a JSON-RPC 2.0 error envelope.
pub fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message.into() },
        "id": id,
    })
}

/// Wrap a JSON-RPC error envelope in an HTTP response.
pub fn rpc_error_response(status: StatusCode, id: Value, code: i64, message: &str) -> Response {
    (status, Json(rpc_error(id, code, message))).into_response()
}

/// Errors surfaced by the HTTP endpoints.
///
/// Everything renders as an OAuth-style body `{error, error_description}`
/// with the status from the mapping table; the MCP endpoint wraps its own
/// failures in JSON-RPC envelopes instead and does not go through here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Authorization header is required")]
    MissingAuthorizationHeader,

    #[error("Authorization header must be 'Bearer <token>'")]
    InvalidAuthorizationFormat,

    #[error("{0}")]
    InvalidToken(String),

    #[error("Too many requests")]
    Throttled { retry_after_secs: u64 },

    #[error("{0}")]
    SessionLimit(String),

    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    fn describe(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
            ApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "Database authentication failed".to_string(),
            ),
            ApiError::MissingAuthorizationHeader => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authorization header is required".to_string(),
            ),
            ApiError::InvalidAuthorizationFormat => (
                StatusCode::UNAUTHORIZED,
                "invalid_request",
                "Authorization header must be 'Bearer <token>'".to_string(),
            ),
            ApiError::InvalidToken(msg) => (StatusCode::UNAUTHORIZED, "invalid_token", msg.clone()),
            ApiError::Throttled { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                format!("Too many requests, retry after {retry_after_secs}s"),
            ),
            ApiError::SessionLimit(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!(error = %err, "request failed");
        }

        let (status, error_code, description) = self.describe();
        let mut body = json!({
            "error": error_code,
            "error_description": description,
        });

        if let ApiError::Throttled { retry_after_secs } = &self {
            body["retry_after"] = json!(retry_after_secs);
            let mut response = (status, Json(body)).into_response();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
            return response;
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}
