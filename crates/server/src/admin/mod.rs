//! Key-guarded admin surface.
//!
//! Read-only JSON endpoints exposing breaker, limiter, and blacklist state.
//! Authentication semantics: no key configured means every admin endpoint
//! answers 403; a missing `X-Admin-Key` header is 401; a mismatched key is
//! 403. Comparison is constant-time.

pub mod handlers;
pub mod middleware;

use axum::{middleware as axum_middleware, routing::get, Router};
use std::sync::Arc;

use crate::state::AppState;

/// Builds the admin routes with the auth layer applied.
pub fn router(state: &AppState) -> Router<AppState> {
    let admin_key = state.config.admin.api_key.clone().map(Arc::new);
    Router::new()
        .route("/status", get(handlers::breaker_status))
        .route("/ratelimitstatus", get(handlers::rate_limit_status))
        .route("/blackliststatus", get(handlers::blacklist_status))
        .layer(axum_middleware::from_fn_with_state(admin_key, middleware::admin_auth))
}
