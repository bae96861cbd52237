//! Admin API authentication middleware.
//!
//! Validates the `X-Admin-Key` header against the configured key using
//! constant-time comparison to prevent timing attacks.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Admin authentication.
///
/// - No key configured: `403` for everything - the admin surface is off.
/// - Header absent: `401`.
/// - Header mismatched: `403`.
pub async fn admin_auth(
    State(admin_key): State<Option<Arc<String>>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = admin_key else {
        return Err(StatusCode::FORBIDDEN);
    };

    let provided = request
        .headers()
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}
