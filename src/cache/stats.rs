//! Cache counters and aggregation
//!
//! Counters are plain atomics: recording never takes a lock and reading a
//! snapshot never blocks a cache operation. Snapshots are eventually
//! consistent across fields.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters for one or more caches
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    in_flight: AtomicU64,
    entries: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn computation_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn computation_finished(&self) {
        // Saturate rather than wrap if a finish is ever double-counted
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn entry_added(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `CacheStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub in_flight: u64,
    pub entries: u64,
}

impl StatsSnapshot {
    /// Total number of lookups
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of lookups served without a new computation
    pub fn hit_ratio(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }

    fn accumulate(&mut self, other: &StatsSnapshot) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.in_flight += other.in_flight;
        self.entries += other.entries;
    }
}

/// Aggregated view over every registered cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub taken_at: DateTime<Utc>,
    pub caches: BTreeMap<String, StatsSnapshot>,
    pub total: StatsSnapshot,
}

/// Registry of named cache counters
///
/// Registration is rare (once per cache at startup); the registry lock only
/// guards the name table, never the counters themselves.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    registered: Arc<RwLock<BTreeMap<String, Arc<CacheStats>>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counters registered under `name`, creating them if needed
    ///
    /// Caches registered under the same name share one set of counters.
    pub fn register(&self, name: &str) -> Arc<CacheStats> {
        if let Some(existing) = self.registered.read().get(name) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.registered
                .write()
                .entry(name.to_string())
                .or_insert_with(CacheStats::new),
        )
    }

    /// Snapshot every registered cache plus the sum across all of them
    pub fn snapshot(&self) -> StatsReport {
        let caches: BTreeMap<String, StatsSnapshot> = self
            .registered
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let mut total = StatsSnapshot::default();
        for snapshot in caches.values() {
            total.accumulate(snapshot);
        }

        StatsReport {
            taken_at: Utc::now(),
            caches,
            total,
        }
    }
}
