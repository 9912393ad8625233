//! Request throttling and credential lifecycle
//!
//! - [`RateLimiter`] - fixed-window counter applied to the MCP endpoint
//! - [`AuthThrottle`] - per-IP brute-force guard on `/auth`
//! - [`TokenService`] - mint/validate/revoke/expire bearer tokens

pub mod auth_throttle;
pub mod rate_limiter;
pub mod token_service;

pub use auth_throttle::AuthThrottle;
pub use rate_limiter::{RateDecision, RateLimiter};
pub use token_service::{CreatedToken, TokenError, TokenService, TokenSession};
