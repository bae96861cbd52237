//! Circuit breaker selecting between the primary and fallback upstream.
//!
//! A three-state FSM (`Closed`, `Open`, `HalfOpen`) driven exclusively by
//! POST dispatch outcomes. The one wrinkle relative to a textbook breaker:
//! without a configured fallback there is nowhere to shed traffic, so the
//! breaker never opens and every request keeps probing the primary.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::alerts::{AlertSink, BreakerAlert};

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: failure count reaches the threshold and a fallback exists
/// - `Open` -> `HalfOpen`: reset timeout expires on the next routing call
/// - `HalfOpen` -> `Closed`: probe succeeds
/// - `HalfOpen` -> `Open`: probe fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; requests go to the primary.
    Closed,
    /// Primary considered down; requests go to the fallback.
    Open,
    /// Recovery mode; the next request probes the primary.
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Mutable state consolidated under a single lock so transitions are atomic.
#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

/// Where the dispatcher should send the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

/// Read-only view for the admin surface.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
    pub has_fallback: bool,
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

/// Per-upstream-pair circuit breaker.
///
/// One instance is constructed at startup and injected into the dispatcher;
/// there are no process-wide singletons.
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
    threshold: u32,
    reset_timeout: Duration,
    has_fallback: bool,
    alerts: Arc<dyn AlertSink>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        threshold: u32,
        reset_timeout: Duration,
        has_fallback: bool,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
            threshold,
            reset_timeout,
            has_fallback,
            alerts,
        }
    }

    /// Decides where the next POST should go.
    ///
    /// In `Open` state this is also where the reset timeout is checked: once
    /// it has elapsed the breaker moves to `HalfOpen` and the caller is told
    /// to probe the primary. Uses double-checked locking so the common
    /// closed-state path stays on a read lock.
    pub async fn route(&self) -> Route {
        if !self.has_fallback {
            return Route::Primary;
        }

        {
            let inner = self.inner.read().await;
            match inner.state {
                BreakerState::Closed | BreakerState::HalfOpen => return Route::Primary,
                BreakerState::Open => {
                    let expired = inner
                        .last_failure_at
                        .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                    if !expired {
                        return Route::Fallback;
                    }
                    // Timeout elapsed: fall through to take the write lock.
                }
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Route::Primary,
            BreakerState::Open => {
                if inner.last_failure_at.is_some_and(|at| at.elapsed() >= self.reset_timeout) {
                    inner.state = BreakerState::HalfOpen;
                    tracing::warn!("circuit breaker half-open; probing primary");
                    Route::Primary
                } else {
                    Route::Fallback
                }
            }
        }
    }

    /// Records a successful primary POST.
    pub async fn on_success(&self) {
        let recovered = {
            let mut inner = self.inner.write().await;
            let was = inner.state;
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.last_failure_at = None;
            was != BreakerState::Closed
        };
        if recovered {
            self.alerts.notify(BreakerAlert::Recovered).await;
        }
    }

    /// Records a failed primary POST.
    ///
    /// Opens the breaker when the threshold is reached - but only when a
    /// fallback is configured; otherwise the count keeps growing in `Closed`.
    pub async fn on_failure(&self) {
        let opened = {
            let mut inner = self.inner.write().await;
            inner.consecutive_failures += 1;
            inner.last_failure_at = Some(Instant::now());

            let should_open = self.has_fallback &&
                inner.state != BreakerState::Open &&
                (inner.state == BreakerState::HalfOpen ||
                    inner.consecutive_failures >= self.threshold);
            if should_open {
                inner.state = BreakerState::Open;
                Some(inner.consecutive_failures)
            } else {
                None
            }
        };
        if let Some(consecutive_failures) = opened {
            self.alerts.notify(BreakerAlert::Opened { consecutive_failures }).await;
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().await;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
            has_fallback: self.has_fallback,
            failure_threshold: self.threshold,
            reset_timeout_secs: self.reset_timeout.as_secs(),
        }
    }

    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.has_fallback
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }
}
