//! Per-mode authentication middleware for the MCP endpoint
//!
//! Attaches an [`AuthContext`] to every request that passes, so the
//! request router downstream can pick the pool without re-reading
//! headers.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::config::AuthMode;
use crate::error::ApiError;
use crate::services::{TokenError, TokenSession};
use crate::AppState;

/// What the auth middleware learned about the caller.
#[derive(Clone)]
pub enum AuthContext {
    /// `none` mode: anybody may pass.
    Anonymous,
    /// `token` mode: the pre-shared token matched.
    StaticToken,
    /// `required` mode: a live token session.
    Session(TokenSession),
}

/// Extract the value of an `Authorization: Bearer` header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(ApiError::MissingAuthorizationHeader)?
        .to_str()
        .map_err(|_| ApiError::InvalidAuthorizationFormat)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::InvalidAuthorizationFormat)?;
    if token.is_empty() {
        return Err(ApiError::InvalidAuthorizationFormat);
    }
    Ok(token.to_string())
}

/// Constant-time comparison for the pre-shared static token.
///
/// Unequal lengths return false up front; the content comparison itself
/// never branches on where the first difference sits.
pub fn constant_time_token_eq(candidate: &str, expected: &str) -> bool {
    let candidate = candidate.as_bytes();
    let expected = expected.as_bytes();
    if candidate.len() != expected.len() {
        return false;
    }
    candidate.ct_eq(expected).into()
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = match state.config.auth_mode {
        AuthMode::None => AuthContext::Anonymous,

        AuthMode::Token => {
            let token = extract_bearer_token(request.headers())?;
            let expected = state
                .config
                .static_token
                .as_deref()
                .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("static token not configured")))?;
            if !constant_time_token_eq(&token, expected) {
                return Err(ApiError::InvalidToken("The access token is invalid".into()));
            }
            AuthContext::StaticToken
        }

        AuthMode::Required => {
            let token = extract_bearer_token(request.headers())?;
            let session = state.tokens.validate(&token).await.map_err(|e| match e {
                TokenError::InvalidFormat => {
                    ApiError::InvalidToken("Invalid token format".into())
                }
                TokenError::NotFound => {
                    ApiError::InvalidToken("Token not found or expired".into())
                }
                TokenError::Expired => ApiError::InvalidToken("Token expired".into()),
                TokenError::SessionLimit => {
                    ApiError::Internal(anyhow::anyhow!("unexpected session limit on validate"))
                }
            })?;
            AuthContext::Session(session)
        }
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
