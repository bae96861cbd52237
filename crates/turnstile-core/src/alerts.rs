//! Breaker alert delivery.
//!
//! The circuit breaker reports state transitions through an injected
//! [`AlertSink`] so operators can wire chat or webhook delivery without the
//! core depending on it. Sinks are fire-and-forget: `notify` cannot return
//! an error, and implementations are expected to swallow their own failures
//! after a log line. A misbehaving sink must never ripple into the dispatch
//! path.

use async_trait::async_trait;

/// A circuit-breaker state transition worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerAlert {
    /// The breaker opened; traffic is being routed to the fallback.
    Opened { consecutive_failures: u32 },
    /// A half-open probe succeeded; traffic is back on the primary.
    Recovered,
}

/// Destination for breaker alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Delivers one alert. Implementations must not panic and must swallow
    /// delivery failures internally.
    async fn notify(&self, alert: BreakerAlert);
}

/// Default sink: structured log lines.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: BreakerAlert) {
        match alert {
            BreakerAlert::Opened { consecutive_failures } => {
                tracing::error!(consecutive_failures, "circuit breaker opened; serving from fallback");
            }
            BreakerAlert::Recovered => {
                tracing::info!("circuit breaker recovered; serving from primary");
            }
        }
    }
}
