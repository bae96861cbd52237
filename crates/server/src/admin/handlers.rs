//! Admin endpoint handlers.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use turnstile_core::{
    clock,
    store::{EffectiveCount, StoreFeatures},
};

use crate::state::AppState;

/// GET /status
///
/// Breaker snapshot plus process identity.
pub async fn breaker_status(State(state): State<AppState>) -> impl IntoResponse {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct BreakerStatus {
        state: &'static str,
        consecutive_failures: u32,
        seconds_since_last_failure: Option<u64>,
        has_fallback: bool,
        failure_threshold: u32,
        reset_timeout_secs: u64,
        uptime: String,
        version: &'static str,
    }

    let snap = state.breaker.snapshot().await;
    Json(BreakerStatus {
        state: snap.state.as_str(),
        consecutive_failures: snap.consecutive_failures,
        seconds_since_last_failure: snap.seconds_since_last_failure,
        has_fallback: snap.has_fallback,
        failure_threshold: snap.failure_threshold,
        reset_timeout_secs: snap.reset_timeout_secs,
        uptime: state.uptime_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ratelimitstatus
///
/// Full limiter snapshot: sliding-window weight, time until the windows
/// reset, per-origin and per-IP readings, blocklists, feature flags, and the
/// configured limits.
pub async fn rate_limit_status(State(state): State<AppState>) -> impl IntoResponse {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct SlidingWindow {
        previous_hour_weight: f64,
        seconds_to_next_hour: i64,
        seconds_to_next_midnight: i64,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Summary {
        tracked_origins: usize,
        tracked_ips: usize,
        blocked_origins: usize,
        blocked_ips: usize,
        snapshot_age_secs: i64,
        consecutive_poll_failures: u32,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Blocked<'a> {
        origins_hourly: Vec<&'a String>,
        origins_daily: Vec<&'a String>,
        ips_hourly: Vec<&'a String>,
        ips_daily: Vec<&'a String>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct RateLimitStatus<'a> {
        sliding_window: SlidingWindow,
        summary: Summary,
        blocked: Blocked<'a>,
        origin_counts: &'a ahash::AHashMap<String, EffectiveCount>,
        ip_counts: &'a ahash::AHashMap<String, EffectiveCount>,
        origin_daily_counts: &'a ahash::AHashMap<String, i64>,
        ip_daily_counts: &'a ahash::AHashMap<String, i64>,
        features: StoreFeatures,
        limits: turnstile_core::limiter::LimitsConfig,
        aggregator_pending_requests: i64,
    }

    let snap = state.limiter.current_snapshot();
    let status = state.limiter.status();
    let now = clock::now();
    let aggregator = state.aggregator.snapshot();

    let body = RateLimitStatus {
        sliding_window: SlidingWindow {
            previous_hour_weight: snap.previous_hour_weight,
            seconds_to_next_hour: clock::seconds_to_next_hour(now),
            seconds_to_next_midnight: clock::seconds_to_next_midnight(now),
        },
        summary: Summary {
            tracked_origins: snap.origin_counts.len(),
            tracked_ips: snap.ip_counts.len(),
            blocked_origins: status.blocked_origin_count,
            blocked_ips: status.blocked_ip_count,
            snapshot_age_secs: status.snapshot_age_secs,
            consecutive_poll_failures: status.consecutive_poll_failures,
        },
        blocked: Blocked {
            origins_hourly: snap.blocked_origins_hourly.iter().collect(),
            origins_daily: snap.blocked_origins_daily.iter().collect(),
            ips_hourly: snap.blocked_ips_hourly.iter().collect(),
            ips_daily: snap.blocked_ips_daily.iter().collect(),
        },
        origin_counts: &snap.origin_counts,
        ip_counts: &snap.ip_counts,
        origin_daily_counts: &snap.origin_daily_counts,
        ip_daily_counts: &snap.ip_daily_counts,
        features: snap.features,
        limits: status.limits,
        aggregator_pending_requests: aggregator.pending_requests,
    };

    Json(serde_json::to_value(&body).unwrap_or_else(|_| serde_json::json!({})))
}

/// GET /blackliststatus
pub async fn blacklist_status(State(state): State<AppState>) -> impl IntoResponse {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct BlacklistStatus {
        enabled: bool,
        path: Option<String>,
        entries: usize,
    }

    Json(BlacklistStatus {
        enabled: state.blacklist.path().is_some(),
        path: state.blacklist.path().map(|p| p.display().to_string()),
        entries: state.blacklist.len(),
    })
}
