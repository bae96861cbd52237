//! Per-origin and per-IP request accounting.
//!
//! The [`Aggregator`] is the only structure mutated from both request tasks
//! and a background loop, so its contract is deliberately small: `credit`
//! under the lock, `swap` under the lock, nothing else. The flush loop in
//! [`flush`] drains it into the counter store on an interval and merges the
//! drained values back when persistence fails, so a flush failure costs one
//! cycle of latency, never data.

pub mod aggregator;
pub mod flush;

pub use aggregator::{Aggregator, IpStats};
pub use flush::{DemandSink, FlushLoop, NoopDemandSink, NoopSettlementHook, SettlementHook};

/// Errors surfaced by flush collaborators.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("{0}")]
    Sink(String),
}
