//! Shared handler state.

use std::{sync::Arc, time::Instant};

use turnstile_core::{
    blacklist::IpBlacklist, breaker::CircuitBreaker, config::AppConfig, dispatch::Dispatcher,
    limiter::RateLimiter, rejects::RejectLog, telemetry::Aggregator,
};

/// Everything the routers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub blacklist: Arc<IpBlacklist>,
    pub aggregator: Arc<Aggregator>,
    pub rejects: RejectLog,
    pub started_at: Instant,
}

impl AppState {
    /// Human-readable process uptime for the admin surface.
    #[must_use]
    pub fn uptime_string(&self) -> String {
        let secs = self.started_at.elapsed().as_secs();
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
