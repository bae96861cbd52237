//! Postgres-backed counter store.
//!
//! Owns the global reset protocol: on every flush invocation the monthly,
//! daily, and hourly windows are rolled forward *before* any per-IP upsert,
//! so the first write after a boundary lands in the new window. The hourly
//! roll snapshots the closing hour into the history table before zeroing it.
//!
//! Schema capabilities are probed once (column existence, presence of the
//! `jsonb_add_merge` helper) and select query variants; a missing capability
//! degrades behavior instead of failing.

use ahash::AHashMap;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{CounterStore, EffectiveCount, StoreError, StoreFeatures, ROW_CAP};
use crate::{clock, store::filter_origins, telemetry::IpStats};

/// History rows older than this are purged.
const HISTORY_RETENTION_SECS: i64 = 30 * clock::DAY_SECS;

/// Minimum spacing between history purges.
const HISTORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Name of the optional JSONB ADD-merge helper probed at runtime.
const ADD_MERGE_FN: &str = "jsonb_add_merge";

/// Cached window boundaries of the last observed resets, all epoch seconds.
#[derive(Debug, Default)]
struct ResetState {
    hourly: Option<i64>,
    daily: Option<i64>,
    monthly: Option<i64>,
    last_history_cleanup: Option<Instant>,
}

/// Production [`CounterStore`] over a bounded Postgres pool.
pub struct PgCounterStore {
    pool: PgPool,
    features: tokio::sync::OnceCell<StoreFeatures>,
    upsert_sql: tokio::sync::OnceCell<UpsertSql>,
    reset_state: tokio::sync::Mutex<ResetState>,
}

impl PgCounterStore {
    /// Connects a bounded pool to the given database URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the pool cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool))
    }

    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            features: tokio::sync::OnceCell::new(),
            upsert_sql: tokio::sync::OnceCell::new(),
            reset_state: tokio::sync::Mutex::new(ResetState::default()),
        }
    }

    /// Probes column existence and the merge helper.
    async fn probe_features(&self) -> Result<StoreFeatures, StoreError> {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns WHERE table_name = 'ip_counters'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut columns = ahash::AHashSet::new();
        for row in &rows {
            columns.insert(row.try_get::<String, _>("column_name")?);
        }

        let add_merge_fn: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_proc WHERE proname = $1)")
                .bind(ADD_MERGE_FN)
                .fetch_one(&self.pool)
                .await?;

        let features = StoreFeatures {
            sliding_window: columns.contains("requests_previous_hour"),
            daily_limits: columns.contains("requests_today"),
            hourly_origin_map: columns.contains("origins_last_hour"),
            add_merge_fn,
        };

        if !features.add_merge_fn {
            warn!(
                "database lacks {ADD_MERGE_FN}; origin maps degrade to last-write-wins merges"
            );
        }
        info!(?features, "counter store capabilities probed");
        Ok(features)
    }

    /// Loads cached reset timestamps, bootstrapping from the table (or the
    /// current boundaries for an empty table) on first use.
    async fn ensure_reset_cache(
        &self,
        state: &mut ResetState,
        features: StoreFeatures,
        now: i64,
    ) -> Result<(), StoreError> {
        if state.hourly.is_none() {
            let min: Option<i64> =
                sqlx::query_scalar("SELECT MIN(last_reset_timestamp) FROM ip_counters")
                    .fetch_one(&self.pool)
                    .await?;
            state.hourly = Some(min.unwrap_or_else(|| clock::hour_start(now)));
        }
        if state.daily.is_none() {
            let min: Option<i64> = if features.daily_limits {
                sqlx::query_scalar("SELECT MIN(last_day_reset_timestamp) FROM ip_counters")
                    .fetch_one(&self.pool)
                    .await?
            } else {
                None
            };
            state.daily = Some(min.unwrap_or_else(|| clock::day_start(now)));
        }
        if state.monthly.is_none() {
            let min: Option<i64> =
                sqlx::query_scalar("SELECT MIN(last_month_reset_timestamp) FROM ip_counters")
                    .fetch_one(&self.pool)
                    .await?;
            state.monthly = Some(min.unwrap_or_else(|| clock::month_start(now)));
        }
        Ok(())
    }

    /// Zeroes monthly counters when a UTC month boundary was crossed.
    async fn reset_monthly_counters(
        &self,
        state: &mut ResetState,
        now: i64,
    ) -> Result<(), StoreError> {
        let current = clock::month_start(now);
        if state.monthly.is_some_and(|last| current > last) {
            sqlx::query(
                "UPDATE ip_counters SET requests_this_month = 0, last_month_reset_timestamp = $1",
            )
            .bind(current)
            .execute(&self.pool)
            .await?;
            info!(month_start = current, "monthly counters reset");
            state.monthly = Some(current);
        }
        Ok(())
    }

    /// Zeroes daily counters when a UTC day boundary was crossed.
    async fn reset_daily_counters(
        &self,
        state: &mut ResetState,
        features: StoreFeatures,
        now: i64,
    ) -> Result<(), StoreError> {
        if !features.daily_limits {
            return Ok(());
        }
        let current = clock::day_start(now);
        if state.daily.is_some_and(|last| current > last) {
            sqlx::query(
                "UPDATE ip_counters SET requests_today = 0, origins_today = '{}'::jsonb, \
                 last_day_reset_timestamp = $1",
            )
            .bind(current)
            .execute(&self.pool)
            .await?;
            info!(day_start = current, "daily counters reset");
            state.daily = Some(current);
        }
        Ok(())
    }

    /// Rolls the hourly window forward: snapshot the closing hour into the
    /// history table, shift current into previous (or clear both after an
    /// idle gap), and stamp the new reset timestamp on every row.
    async fn reset_hourly_counters(
        &self,
        state: &mut ResetState,
        features: StoreFeatures,
        now: i64,
    ) -> Result<(), StoreError> {
        let current = clock::hour_start(now);
        let Some(last) = state.hourly else { return Ok(()) };
        if current <= last {
            self.cleanup_history(state, now).await?;
            return Ok(());
        }

        // Snapshot before anything is zeroed; the closing hour is keyed by
        // the previous reset timestamp.
        let origins_expr = if features.hourly_origin_map { "origins_last_hour" } else { "'{}'::jsonb" };
        let snapshot_sql = format!(
            "INSERT INTO ip_history (hour_timestamp, ip, request_count, origins, created_at) \
             SELECT $1, ip, requests_last_hour, {origins_expr}, NOW() \
             FROM ip_counters WHERE requests_last_hour > 0 \
             ON CONFLICT (hour_timestamp, ip) DO NOTHING",
        );
        let snapshotted = sqlx::query(&snapshot_sql).bind(last).execute(&self.pool).await?;
        debug!(rows = snapshotted.rows_affected(), hour = last, "hourly snapshot written");

        // A gap of exactly one hour shifts the window; anything longer means
        // the previous-hour data is stale and both windows clear.
        let contiguous = current - last == clock::HOUR_SECS;
        let shift_sql = match (features.sliding_window, contiguous) {
            (true, true) => {
                "UPDATE ip_counters SET \
                 requests_previous_hour = requests_last_hour, \
                 origins_previous_hour = origins_last_hour, \
                 requests_last_hour = 0, origins_last_hour = '{}'::jsonb, \
                 last_reset_timestamp = $1"
            }
            (true, false) => {
                "UPDATE ip_counters SET \
                 requests_previous_hour = 0, origins_previous_hour = '{}'::jsonb, \
                 requests_last_hour = 0, origins_last_hour = '{}'::jsonb, \
                 last_reset_timestamp = $1"
            }
            (false, _) => {
                "UPDATE ip_counters SET \
                 requests_last_hour = 0, origins_last_hour = '{}'::jsonb, \
                 last_reset_timestamp = $1"
            }
        };
        sqlx::query(shift_sql).bind(current).execute(&self.pool).await?;
        info!(hour_start = current, contiguous, "hourly counters rolled");
        state.hourly = Some(current);

        self.cleanup_history(state, now).await
    }

    /// Purges history rows older than 30 days, at most once per 24 hours.
    async fn cleanup_history(&self, state: &mut ResetState, now: i64) -> Result<(), StoreError> {
        let due = state
            .last_history_cleanup
            .map_or(true, |at| at.elapsed() >= HISTORY_CLEANUP_INTERVAL);
        if !due {
            return Ok(());
        }
        let cutoff = now - HISTORY_RETENTION_SECS;
        let deleted = sqlx::query("DELETE FROM ip_history WHERE hour_timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() > 0 {
            info!(rows = deleted.rows_affected(), cutoff, "history rows purged");
        }
        state.last_history_cleanup = Some(Instant::now());
        Ok(())
    }

    /// Applies one IP's aggregate.
    async fn upsert_ip(
        &self,
        sql: &UpsertSql,
        resets: ResetTimestamps,
        ip: &str,
        stats: &IpStats,
    ) -> Result<(), StoreError> {
        let origins = serde_json::to_value(filter_origins(&stats.origins))
            .unwrap_or_else(|_| serde_json::json!({}));

        let mut insert = sqlx::query(&sql.insert)
            .bind(ip)
            .bind(stats.count)
            .bind(&origins)
            .bind(resets.hourly)
            .bind(resets.monthly);
        if sql.binds_daily_reset {
            insert = insert.bind(resets.daily);
        }
        insert.execute(&self.pool).await?;

        if let Some(daily_sql) = &sql.daily_update {
            sqlx::query(daily_sql)
                .bind(ip)
                .bind(stats.count)
                .bind(&origins)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

/// Reset timestamps copied out of the cache for use while upserting.
#[derive(Debug, Clone, Copy)]
struct ResetTimestamps {
    hourly: i64,
    daily: i64,
    monthly: i64,
}

/// Upsert statements rendered once for the probed capability set.
#[derive(Debug)]
struct UpsertSql {
    insert: String,
    daily_update: Option<String>,
    /// Whether the insert carries the `$6` daily reset parameter.
    binds_daily_reset: bool,
}

impl UpsertSql {
    fn build(features: StoreFeatures) -> Self {
        // $1 ip, $2 count, $3 origin map, $4 hourly reset, $5 monthly reset,
        // $6 daily reset (bound only when the daily columns exist).
        let merge = |target: &str| {
            if features.add_merge_fn {
                format!("{ADD_MERGE_FN}(ip_counters.{target}, EXCLUDED.{target})")
            } else {
                format!("EXCLUDED.{target}")
            }
        };

        let mut insert_cols = String::from(
            "ip, requests_total, requests_last_hour, requests_this_month, origins, \
             last_reset_timestamp, last_month_reset_timestamp, updated_at",
        );
        let mut insert_vals = String::from("$1, $2, $2, $2, $3, $4, $5, NOW()");
        if features.hourly_origin_map {
            insert_cols.push_str(", origins_last_hour");
            insert_vals.push_str(", $3");
        }
        if features.daily_limits {
            insert_cols.push_str(", last_day_reset_timestamp");
            insert_vals.push_str(", $6");
        }

        let mut updates = format!(
            "requests_total = ip_counters.requests_total + EXCLUDED.requests_total, \
             requests_last_hour = ip_counters.requests_last_hour + EXCLUDED.requests_last_hour, \
             requests_this_month = ip_counters.requests_this_month + EXCLUDED.requests_this_month, \
             origins = {}, updated_at = NOW()",
            merge("origins"),
        );
        if features.hourly_origin_map {
            updates.push_str(&format!(", origins_last_hour = {}", merge("origins_last_hour")));
        }

        let insert = format!(
            "INSERT INTO ip_counters ({insert_cols}) VALUES ({insert_vals}) \
             ON CONFLICT (ip) DO UPDATE SET {updates}",
        );
        let binds_daily_reset = features.daily_limits;

        // The daily window is written by a follow-up update so the variant
        // set stays small; the row is guaranteed to exist by then.
        let daily_update = features.daily_limits.then(|| {
            let origins_today = if features.add_merge_fn {
                format!("{ADD_MERGE_FN}(origins_today, $3)")
            } else {
                "$3".to_string()
            };
            format!(
                "UPDATE ip_counters SET requests_today = requests_today + $2, \
                 origins_today = {origins_today} WHERE ip = $1",
            )
        });

        Self { insert, daily_update, binds_daily_reset }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn features(&self) -> Result<StoreFeatures, StoreError> {
        self.features.get_or_try_init(|| self.probe_features()).await.copied()
    }

    async fn flush_counts(&self, counts: &AHashMap<String, IpStats>) -> Result<(), StoreError> {
        let features = self.features().await?;
        let now = clock::now();

        // Resets run before any upsert so post-boundary writes land in the
        // new window. The mutex serializes against a concurrent caller; the
        // flush loop is single-flight anyway.
        let resets = {
            let mut state = self.reset_state.lock().await;
            self.ensure_reset_cache(&mut state, features, now).await?;
            self.reset_monthly_counters(&mut state, now).await?;
            self.reset_daily_counters(&mut state, features, now).await?;
            self.reset_hourly_counters(&mut state, features, now).await?;
            ResetTimestamps {
                hourly: state.hourly.unwrap_or_else(|| clock::hour_start(now)),
                daily: state.daily.unwrap_or_else(|| clock::day_start(now)),
                monthly: state.monthly.unwrap_or_else(|| clock::month_start(now)),
            }
        };

        let sql = self.upsert_sql.get_or_init(|| async { UpsertSql::build(features) }).await;

        for (ip, stats) in counts {
            if let Err(err) = self.upsert_ip(sql, resets, ip, stats).await {
                if err.is_batch_fatal() {
                    return Err(err);
                }
                warn!(ip = %ip, error = %err, "counter upsert failed; skipping row");
            }
        }
        Ok(())
    }

    async fn origin_hourly_counts(
        &self,
        previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError> {
        let features = self.features().await?;
        if !features.hourly_origin_map {
            return Ok(Vec::new());
        }

        let query = if features.sliding_window {
            sqlx::query(
                "SELECT origin, SUM(cur)::bigint AS current_count, SUM(prev)::bigint AS previous_count \
                 FROM ( \
                     SELECT e.key AS origin, e.value::bigint AS cur, 0::bigint AS prev \
                     FROM ip_counters, jsonb_each_text(origins_last_hour) AS e \
                     UNION ALL \
                     SELECT e.key, 0::bigint, e.value::bigint \
                     FROM ip_counters, jsonb_each_text(origins_previous_hour) AS e \
                 ) AS per_origin \
                 GROUP BY origin \
                 ORDER BY SUM(cur) + SUM(prev) * $1 DESC \
                 LIMIT $2",
            )
            .bind(previous_hour_weight)
            .bind(ROW_CAP)
        } else {
            sqlx::query(
                "SELECT e.key AS origin, SUM(e.value::bigint)::bigint AS current_count, \
                        0::bigint AS previous_count \
                 FROM ip_counters, jsonb_each_text(origins_last_hour) AS e \
                 GROUP BY e.key \
                 ORDER BY SUM(e.value::bigint) DESC \
                 LIMIT $1",
            )
            .bind(ROW_CAP)
        };

        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let origin: String = row.try_get("origin")?;
                let current: i64 = row.try_get("current_count")?;
                let previous: i64 = row.try_get("previous_count")?;
                Ok((origin, EffectiveCount::new(current, previous, previous_hour_weight)))
            })
            .collect()
    }

    async fn ip_hourly_counts(
        &self,
        previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError> {
        let features = self.features().await?;

        let query = if features.sliding_window {
            sqlx::query(
                "SELECT ip, requests_last_hour, requests_previous_hour \
                 FROM ip_counters \
                 ORDER BY requests_last_hour + requests_previous_hour * $1 DESC \
                 LIMIT $2",
            )
            .bind(previous_hour_weight)
            .bind(ROW_CAP)
        } else {
            sqlx::query(
                "SELECT ip, requests_last_hour, 0::bigint AS requests_previous_hour \
                 FROM ip_counters \
                 ORDER BY requests_last_hour DESC \
                 LIMIT $1",
            )
            .bind(ROW_CAP)
        };

        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let ip: String = row.try_get("ip")?;
                let current: i64 = row.try_get("requests_last_hour")?;
                let previous: i64 = row.try_get("requests_previous_hour")?;
                Ok((ip, EffectiveCount::new(current, previous, previous_hour_weight)))
            })
            .collect()
    }

    async fn origin_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let features = self.features().await?;
        if !features.daily_limits {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT e.key AS origin, SUM(e.value::bigint)::bigint AS total \
             FROM ip_counters, jsonb_each_text(origins_today) AS e \
             GROUP BY e.key \
             ORDER BY total DESC \
             LIMIT $1",
        )
        .bind(ROW_CAP)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("origin")?, row.try_get("total")?)))
            .collect()
    }

    async fn ip_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let features = self.features().await?;
        if !features.daily_limits {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT ip, requests_today FROM ip_counters ORDER BY requests_today DESC LIMIT $1",
        )
        .bind(ROW_CAP)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("ip")?, row.try_get("requests_today")?)))
            .collect()
    }
}
