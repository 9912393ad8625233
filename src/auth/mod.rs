//! Authentication plane
//!
//! - [`handlers`] - the `/auth` credential-exchange endpoint
//! - [`middleware`] - per-mode bearer extraction for `/mcp`

pub mod handlers;
pub mod middleware;

pub use handlers::auth_handler;
pub use middleware::{require_auth, AuthContext};
