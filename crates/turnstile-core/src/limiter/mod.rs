//! Store-backed sliding-window rate limiter.
//!
//! The limiter never touches the database on the request path. A background
//! poll loop periodically reads effective counts from the counter store,
//! builds fresh blocklists, and swaps the whole snapshot atomically;
//! [`RateLimiter::check`] is a handful of hash lookups against the current
//! snapshot.
//!
//! Public origins are limited per origin, everything else per client IP, and
//! daily caps are consulted before the hourly sliding window. When polling
//! fails repeatedly the last good blocklists stay in force: known offenders
//! remain blocked, newcomers are let through.

use ahash::{AHashMap, AHashSet};
use arc_swap::ArcSwap;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    client::origin::{classify, clean_origin, OriginClass},
    clock,
    store::{CounterStore, EffectiveCount, StoreFeatures},
};

/// Poll failures before escalating to an error log about stale blocklists.
const STALE_ESCALATION_THRESHOLD: u32 = 3;

/// Configured ceilings. An entity is blocked when its count **strictly
/// exceeds** the matching limit.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LimitsConfig {
    pub origin_hourly: i64,
    pub ip_hourly: i64,
    pub origin_daily: i64,
    pub ip_daily: i64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { reason: String, retry_after_secs: i64 },
}

/// One poll's worth of limiter state, replaced wholesale on every refresh.
#[derive(Debug, Default, serde::Serialize)]
pub struct LimiterSnapshot {
    pub blocked_origins_hourly: AHashSet<String>,
    pub blocked_origins_daily: AHashSet<String>,
    pub blocked_ips_hourly: AHashSet<String>,
    pub blocked_ips_daily: AHashSet<String>,
    pub origin_counts: AHashMap<String, EffectiveCount>,
    pub ip_counts: AHashMap<String, EffectiveCount>,
    pub origin_daily_counts: AHashMap<String, i64>,
    pub ip_daily_counts: AHashMap<String, i64>,
    pub previous_hour_weight: f64,
    /// Epoch seconds of the last successful refresh; 0 before the first.
    pub refreshed_at: i64,
    pub features: StoreFeatures,
}

/// Admin view of the limiter.
#[derive(Debug, serde::Serialize)]
pub struct LimiterStatus {
    pub snapshot_age_secs: i64,
    pub consecutive_poll_failures: u32,
    pub limits: LimitsConfig,
    pub seconds_to_next_hour: i64,
    pub seconds_to_next_midnight: i64,
    pub blocked_origin_count: usize,
    pub blocked_ip_count: usize,
}

/// Sliding-window rate limiter over counter-store snapshots.
pub struct RateLimiter {
    snapshot: ArcSwap<LimiterSnapshot>,
    limits: LimitsConfig,
    store: Arc<dyn CounterStore>,
    poll_interval: std::time::Duration,
    consecutive_poll_failures: AtomicU32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        limits: LimitsConfig,
        store: Arc<dyn CounterStore>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(LimiterSnapshot::default()),
            limits,
            store,
            poll_interval,
            consecutive_poll_failures: AtomicU32::new(0),
        }
    }

    /// Admission check: a few hash lookups, no suspension.
    ///
    /// Public origins consult the origin tier, everything else the IP tier;
    /// the daily cap is consulted before the hourly window in both tiers.
    /// Internal problems read as "not limited".
    #[must_use]
    pub fn check(&self, ip: &str, origin: &str) -> RateDecision {
        let snap = self.snapshot.load();
        let now = clock::now();

        match classify(origin) {
            OriginClass::Public => {
                let key = clean_origin(origin);
                if snap.blocked_origins_daily.contains(&key) {
                    return RateDecision::Limited {
                        reason: format!("origin {key} exceeded the daily limit"),
                        retry_after_secs: clock::seconds_to_next_midnight(now),
                    };
                }
                if snap.blocked_origins_hourly.contains(&key) {
                    return RateDecision::Limited {
                        reason: format!("origin {key} exceeded the hourly limit"),
                        retry_after_secs: clock::seconds_to_next_hour(now),
                    };
                }
            }
            OriginClass::LocalLike => {
                if snap.blocked_ips_daily.contains(ip) {
                    return RateDecision::Limited {
                        reason: format!("ip {ip} exceeded the daily limit"),
                        retry_after_secs: clock::seconds_to_next_midnight(now),
                    };
                }
                if snap.blocked_ips_hourly.contains(ip) {
                    return RateDecision::Limited {
                        reason: format!("ip {ip} exceeded the hourly limit"),
                        retry_after_secs: clock::seconds_to_next_hour(now),
                    };
                }
            }
        }
        RateDecision::Allowed
    }

    /// One poll cycle: read counts, rebuild blocklists, swap.
    ///
    /// On failure the previous snapshot stays in force; after
    /// [`STALE_ESCALATION_THRESHOLD`] consecutive failures the log level
    /// escalates because the blocklists are going stale.
    pub async fn poll_once(&self) -> bool {
        match self.build_snapshot().await {
            Ok(snapshot) => {
                debug!(
                    blocked_origins =
                        snapshot.blocked_origins_hourly.len() + snapshot.blocked_origins_daily.len(),
                    blocked_ips =
                        snapshot.blocked_ips_hourly.len() + snapshot.blocked_ips_daily.len(),
                    weight = snapshot.previous_hour_weight,
                    "rate-limit snapshot refreshed"
                );
                self.snapshot.store(Arc::new(snapshot));
                self.consecutive_poll_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(err) => {
                let failures = self.consecutive_poll_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= STALE_ESCALATION_THRESHOLD {
                    error!(
                        failures,
                        error = %err,
                        "rate-limit poll keeps failing; retaining stale blocklists"
                    );
                } else {
                    warn!(failures, error = %err, "rate-limit poll failed");
                }
                false
            }
        }
    }

    async fn build_snapshot(&self) -> Result<LimiterSnapshot, crate::store::StoreError> {
        let features = self.store.features().await?;
        let now = clock::now();
        let weight = clock::previous_hour_weight(now);

        let origin_hourly = self.store.origin_hourly_counts(weight).await?;
        let ip_hourly = self.store.ip_hourly_counts(weight).await?;
        let origin_daily = self.store.origin_daily_counts().await?;
        let ip_daily = self.store.ip_daily_counts().await?;

        let mut snapshot = LimiterSnapshot {
            previous_hour_weight: weight,
            refreshed_at: now,
            features,
            ..LimiterSnapshot::default()
        };

        for (origin, count) in origin_hourly {
            if count.effective > self.limits.origin_hourly as f64 {
                snapshot.blocked_origins_hourly.insert(origin.clone());
            }
            snapshot.origin_counts.insert(origin, count);
        }
        for (ip, count) in ip_hourly {
            if count.effective > self.limits.ip_hourly as f64 {
                snapshot.blocked_ips_hourly.insert(ip.clone());
            }
            snapshot.ip_counts.insert(ip, count);
        }
        for (origin, total) in origin_daily {
            if total > self.limits.origin_daily {
                snapshot.blocked_origins_daily.insert(origin.clone());
            }
            snapshot.origin_daily_counts.insert(origin, total);
        }
        for (ip, total) in ip_daily {
            if total > self.limits.ip_daily {
                snapshot.blocked_ips_daily.insert(ip.clone());
            }
            snapshot.ip_daily_counts.insert(ip, total);
        }

        Ok(snapshot)
    }

    /// Spawns the poll loop. Single-flight by construction: ticks that fire
    /// while a poll is still running are skipped, not queued.
    pub fn spawn_poller(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            // Populate the first snapshot immediately rather than waiting a
            // full interval.
            self.poll_once().await;

            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("rate-limit poller shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.poll_once().await;
                    }
                }
            }
        });
    }

    /// Current snapshot, for the admin surface.
    #[must_use]
    pub fn current_snapshot(&self) -> Arc<LimiterSnapshot> {
        self.snapshot.load_full()
    }

    #[must_use]
    pub fn status(&self) -> LimiterStatus {
        let snap = self.snapshot.load();
        let now = clock::now();
        LimiterStatus {
            snapshot_age_secs: if snap.refreshed_at == 0 { -1 } else { now - snap.refreshed_at },
            consecutive_poll_failures: self.consecutive_poll_failures.load(Ordering::Relaxed),
            limits: self.limits,
            seconds_to_next_hour: clock::seconds_to_next_hour(now),
            seconds_to_next_midnight: clock::seconds_to_next_midnight(now),
            blocked_origin_count: snap.blocked_origins_hourly.len() +
                snap.blocked_origins_daily.len(),
            blocked_ip_count: snap.blocked_ips_hourly.len() + snap.blocked_ips_daily.len(),
        }
    }
}
