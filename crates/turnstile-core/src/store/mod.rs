//! Counter persistence.
//!
//! The [`CounterStore`] trait is the seam between the request plane and the
//! relational store: the flush loop writes aggregated counts through it and
//! the rate-limiter poller reads effective counts back. The production
//! implementation is [`PgCounterStore`]; tests substitute in-memory doubles.

pub mod postgres;

pub use postgres::PgCounterStore;

use ahash::AHashMap;
use async_trait::async_trait;

use crate::{
    client::origin::{classify, OriginClass},
    telemetry::IpStats,
};

/// Maximum rows fetched per limiter query, ordered by count descending.
///
/// Entities below the cap cannot be over any realistic limit; bounding the
/// result set keeps poll cost flat as the counter table grows.
pub const ROW_CAP: i64 = 10_000;

/// Store access errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True when the whole batch should be abandoned so the aggregator can
    /// merge its data back, as opposed to a single-row problem worth
    /// skipping.
    #[must_use]
    pub fn is_batch_fatal(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut |
                    sqlx::Error::PoolClosed |
                    sqlx::Error::Io(_) |
                    sqlx::Error::Protocol(_)
            ),
        }
    }
}

/// Schema capabilities probed once at startup.
///
/// Absence of a capability selects a documented degraded mode rather than an
/// error: no sliding-window columns means fixed-window limiting, no daily
/// columns means no daily caps, no merge function means last-write-wins
/// origin maps.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreFeatures {
    /// `requests_previous_hour` / `origins_previous_hour` columns exist.
    pub sliding_window: bool,
    /// `requests_today` / `origins_today` / day-reset columns exist.
    pub daily_limits: bool,
    /// `origins_last_hour` per-hour origin map column exists.
    pub hourly_origin_map: bool,
    /// The JSONB ADD-merge helper function is installed.
    pub add_merge_fn: bool,
}

/// A sliding-window reading for one origin or IP.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct EffectiveCount {
    pub current: i64,
    pub previous: i64,
    pub effective: f64,
}

impl EffectiveCount {
    #[must_use]
    pub fn new(current: i64, previous: i64, previous_hour_weight: f64) -> Self {
        Self { current, previous, effective: current as f64 + previous as f64 * previous_hour_weight }
    }
}

/// Access to the counter and history tables.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Schema capabilities, probed once and cached.
    async fn features(&self) -> Result<StoreFeatures, StoreError>;

    /// Runs the reset protocol and upserts one aggregated batch.
    ///
    /// Invoked every flush cycle even when `counts` is empty, because the
    /// hourly/daily/monthly resets must still run. A returned error means
    /// the batch was not (fully) applied and the caller should retain the
    /// data; single-row failures are logged and skipped internally.
    async fn flush_counts(&self, counts: &AHashMap<String, IpStats>) -> Result<(), StoreError>;

    /// Per-origin sliding-window counts, highest effective first, capped at
    /// [`ROW_CAP`] rows.
    async fn origin_hourly_counts(
        &self,
        previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError>;

    /// Per-IP sliding-window counts, highest effective first, capped.
    async fn ip_hourly_counts(
        &self,
        previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError>;

    /// Per-origin counts for the current UTC day, highest first, capped.
    /// Empty when the schema has no daily columns.
    async fn origin_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError>;

    /// Per-IP counts for the current UTC day, highest first, capped.
    async fn ip_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError>;
}

/// Drops every LocalLike origin from a per-IP origin map.
///
/// Run before each upsert so private and malformed origins never reach the
/// billing table. Idempotent: filtering an already-filtered map is a no-op.
#[must_use]
pub fn filter_origins(origins: &AHashMap<String, i64>) -> AHashMap<String, i64> {
    origins
        .iter()
        .filter(|(origin, _)| classify(origin) == OriginClass::Public)
        .map(|(origin, count)| (origin.clone(), *count))
        .collect()
}
