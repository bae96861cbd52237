//! Background flush of aggregated counts into the store.

use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Aggregator, TelemetryError};
use crate::store::CounterStore;

/// Settlement runs every this many successful flush cycles.
const SETTLEMENT_EVERY: u64 = 10;

/// External consumer of per-origin demand (feeds the settlement pipeline).
#[async_trait]
pub trait DemandSink: Send + Sync {
    async fn record_origin_demand(
        &self,
        origins: &AHashMap<String, i64>,
    ) -> Result<(), TelemetryError>;
}

/// External settlement-transfer step, invoked every tenth successful cycle.
#[async_trait]
pub trait SettlementHook: Send + Sync {
    async fn settle(&self) -> Result<(), TelemetryError>;
}

/// Default demand sink: drops the data after a debug line.
pub struct NoopDemandSink;

#[async_trait]
impl DemandSink for NoopDemandSink {
    async fn record_origin_demand(
        &self,
        origins: &AHashMap<String, i64>,
    ) -> Result<(), TelemetryError> {
        debug!(origins = origins.len(), "origin demand recorded (noop sink)");
        Ok(())
    }
}

/// Default settlement hook: does nothing.
pub struct NoopSettlementHook;

#[async_trait]
impl SettlementHook for NoopSettlementHook {
    async fn settle(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Periodic drain of the aggregator into the store and demand sink.
pub struct FlushLoop {
    aggregator: Arc<Aggregator>,
    store: Arc<dyn CounterStore>,
    demand: Arc<dyn DemandSink>,
    settlement: Arc<dyn SettlementHook>,
    interval: std::time::Duration,
    successful_cycles: AtomicU64,
}

impl FlushLoop {
    #[must_use]
    pub fn new(
        aggregator: Arc<Aggregator>,
        store: Arc<dyn CounterStore>,
        demand: Arc<dyn DemandSink>,
        settlement: Arc<dyn SettlementHook>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            aggregator,
            store,
            demand,
            settlement,
            interval,
            successful_cycles: AtomicU64::new(0),
        }
    }

    /// Spawns the flush loop. Ticks are skipped, not queued, while a flush is
    /// still running; the loop performs one final flush on shutdown so
    /// in-memory counts are not lost.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("flush loop shutting down; draining aggregator");
                        self.flush_once().await;
                        break;
                    }
                    _ = interval.tick() => {
                        self.flush_once().await;
                    }
                }
            }
        })
    }

    /// One flush cycle.
    ///
    /// The store is invoked even when the drained batch is empty, because
    /// the hourly/daily/monthly reset protocol runs on every invocation. On
    /// any failure the drained maps are merged back so no cycle loses data.
    pub async fn flush_once(&self) -> bool {
        let (origin_counts, ip_counts) = self.aggregator.swap();

        let (demand_result, store_result) = tokio::join!(
            self.demand.record_origin_demand(&origin_counts),
            self.store.flush_counts(&ip_counts),
        );

        let failed = demand_result.is_err() || store_result.is_err();
        if failed {
            if let Err(err) = &demand_result {
                warn!(error = %err, "origin demand update failed; merging counts back");
            }
            if let Err(err) = &store_result {
                warn!(error = %err, "counter flush failed; merging counts back");
            }
            // Both halves go back even when only one failed; the bounded
            // double count on the successful half is acceptable for
            // approximate billing.
            self.aggregator.merge_back(origin_counts, ip_counts);
            return false;
        }

        let cycles = self.successful_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycles % SETTLEMENT_EVERY == 0 {
            if let Err(err) = self.settlement.settle().await {
                warn!(error = %err, "settlement step failed");
            }
        }
        true
    }

    /// Successful cycle count, for the admin snapshot.
    #[must_use]
    pub fn successful_cycles(&self) -> u64 {
        self.successful_cycles.load(Ordering::Relaxed)
    }
}
