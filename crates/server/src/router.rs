//! Public HTTP surface: JSON-RPC forwarding, GET probe, liveness.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, field, Instrument, Span};

use turnstile_core::{
    client,
    limiter::RateDecision,
    rpc::{self, Verdict},
    types::{codes, JsonRpcResponse, RpcCall},
};

use crate::{admin, state::AppState};

/// Assembles the full router: public surface plus key-guarded admin routes.
pub fn build(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    let concurrency = state.config.server.max_concurrent_requests;

    Router::new()
        .route("/", get(handle_probe).post(handle_rpc))
        .route("/watchdog", get(watchdog))
        .merge(admin::router(&state))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .with_state(state)
}

/// GET /watchdog - unauthenticated liveness.
async fn watchdog() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

/// GET / - diagnostic probe of primary then fallback. Does not feed the
/// breaker.
async fn handle_probe(State(state): State<AppState>) -> Response {
    let outcome = state.dispatcher.probe_get().await;
    upstream_response(outcome)
}

/// POST / - the JSON-RPC forwarding path.
///
/// Admission runs in order: validation, deny list, rate limiter. Every
/// rejection is answered as HTTP 200 with a JSON-RPC error body and recorded
/// in the reject log. Admitted traffic is forwarded; primary-upstream
/// successes are credited to the aggregator, fallback traffic never is.
///
/// Every request runs inside an `rpc_request` span carrying the client IP
/// and origin; `method_count` and `fallback` are recorded as they become
/// known.
async fn handle_rpc(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client::client_ip(&headers, Some(peer));
    let origin = client::extract_origin(&headers);

    let span = tracing::info_span!(
        "rpc_request",
        ip = %ip,
        origin = %origin,
        method_count = field::Empty,
        fallback = field::Empty,
    );

    async {
        let call = match rpc::validate_or_bypass(&body) {
            Verdict::Pass(call) => {
                Span::current().record("method_count", call.request_count() as u64);
                Some(call)
            }
            Verdict::Bypass => None,
            Verdict::Reject(reject) => {
                state.rejects.log(&ip, &origin, &reject.message, &body);
                return rpc_error(reject.into_response());
            }
        };

        if state.blacklist.is_blacklisted(&ip) {
            state.rejects.log(&ip, &origin, "blacklisted", &body);
            let id =
                call.as_ref().map_or_else(|| Arc::new(serde_json::Value::Null), RpcCall::error_id);
            return rpc_error(JsonRpcResponse::error(
                codes::FORBIDDEN,
                "IP address is blocked".into(),
                id,
            ));
        }

        if let RateDecision::Limited { reason, retry_after_secs } = state.limiter.check(&ip, &origin)
        {
            state.rejects.log(&ip, &origin, &reason, &body);
            let id =
                call.as_ref().map_or_else(|| Arc::new(serde_json::Value::Null), RpcCall::error_id);
            return rpc_error(JsonRpcResponse::error_with_data(
                codes::RATE_LIMITED,
                "Rate limit exceeded.".into(),
                serde_json::json!({ "retryAfter": retry_after_secs }),
                id,
            ));
        }

        let outcome = state.dispatcher.forward(&headers, body).await;
        Span::current().record("fallback", outcome.used_fallback);

        // Billing rule: only primary-upstream successes count.
        if outcome.upstream_ok && !outcome.used_fallback {
            let n = call.as_ref().map_or(1, |c| c.request_count() as i64);
            state.aggregator.credit(&ip, &origin, n);
        } else {
            debug!(upstream_ok = outcome.upstream_ok, "request not credited");
        }

        upstream_response(outcome)
    }
    .instrument(span)
    .await
}

/// Admission rejections are well-formed JSON-RPC errors: HTTP 200.
fn rpc_error(response: JsonRpcResponse) -> Response {
    (StatusCode::OK, Json(response)).into_response()
}

/// Relays an upstream outcome verbatim.
fn upstream_response(outcome: turnstile_core::dispatch::ForwardOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type =
        outcome.content_type.unwrap_or_else(|| "application/json".to_string());
    (status, [("content-type", content_type)], outcome.body).into_response()
}
