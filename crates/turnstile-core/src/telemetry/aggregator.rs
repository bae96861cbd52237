//! In-memory request counters, swapped out by the flush loop.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::client::{self, ip, origin::OriginClass};

/// Per-IP accumulator: total request count plus a per-origin breakdown for
/// public origins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpStats {
    pub count: i64,
    pub origins: AHashMap<String, i64>,
}

/// Both sub-maps live under one lock so the flush loop's swap is atomic with
/// respect to request-side mutation.
#[derive(Debug, Default)]
struct AggregatorInner {
    origin_counts: AHashMap<String, i64>,
    ip_counts: AHashMap<String, IpStats>,
}

/// Totals for the admin snapshot.
#[derive(Debug, Clone)]
pub struct AggregatorSnapshot {
    pub tracked_origins: usize,
    pub tracked_ips: usize,
    pub pending_requests: i64,
}

/// Thread-safe request accounting.
///
/// Synthetic origins (health checkers, internal probes) are configured at
/// construction and excluded from every counter.
pub struct Aggregator {
    inner: Mutex<AggregatorInner>,
    synthetic_origins: AHashSet<String>,
}

impl Aggregator {
    #[must_use]
    pub fn new(synthetic_origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(AggregatorInner::default()),
            synthetic_origins: synthetic_origins
                .into_iter()
                .map(|o| client::origin::clean_origin(&o))
                .collect(),
        }
    }

    /// Credits `n` successfully served requests to both counters.
    ///
    /// Origin-side: the cleaned origin is counted unless it is empty,
    /// localhost-like, or synthetic. IP-side: loopback clients and synthetic
    /// origins are dropped entirely; public origins additionally feed the
    /// per-IP origin breakdown.
    pub fn credit(&self, ip_addr: &str, raw_origin: &str, n: i64) {
        if n <= 0 {
            return;
        }
        let cleaned = client::origin::clean_origin(raw_origin);
        let synthetic = self.synthetic_origins.contains(&cleaned);
        let origin_class = client::origin::classify(raw_origin);

        let mut inner = self.inner.lock();

        if !cleaned.is_empty() && !cleaned.contains("localhost") && !synthetic {
            *inner.origin_counts.entry(cleaned.clone()).or_insert(0) += n;
        }

        if !ip::is_loopback(ip_addr) && !synthetic {
            let stats = inner.ip_counts.entry(ip_addr.to_string()).or_default();
            stats.count += n;
            if origin_class == OriginClass::Public {
                *stats.origins.entry(cleaned).or_insert(0) += n;
            }
        }
    }

    /// Atomically takes both sub-maps, leaving empty ones behind.
    #[must_use]
    pub fn swap(&self) -> (AHashMap<String, i64>, AHashMap<String, IpStats>) {
        let mut inner = self.inner.lock();
        (std::mem::take(&mut inner.origin_counts), std::mem::take(&mut inner.ip_counts))
    }

    /// Merges previously swapped values back, summing with anything recorded
    /// since the swap. Used when a flush fails so the next cycle retries.
    pub fn merge_back(
        &self,
        origin_counts: AHashMap<String, i64>,
        ip_counts: AHashMap<String, IpStats>,
    ) {
        let mut inner = self.inner.lock();
        for (origin, n) in origin_counts {
            *inner.origin_counts.entry(origin).or_insert(0) += n;
        }
        for (ip_addr, stats) in ip_counts {
            let live = inner.ip_counts.entry(ip_addr).or_default();
            live.count += stats.count;
            for (origin, n) in stats.origins {
                *live.origins.entry(origin).or_insert(0) += n;
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AggregatorSnapshot {
        let inner = self.inner.lock();
        AggregatorSnapshot {
            tracked_origins: inner.origin_counts.len(),
            tracked_ips: inner.ip_counts.len(),
            pending_requests: inner.ip_counts.values().map(|s| s.count).sum(),
        }
    }
}
