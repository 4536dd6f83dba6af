//! In-memory caching with at-most-once computation per key
//!
//! A `Cache` knows nothing about what it stores. Each entry is in one of two
//! states:
//!
//! | State | Meaning |
//! |-------|---------|
//! | Pending | A computation is running; new callers wait on it |
//! | Ready | The value is stored and returned as-is |
//!
//! Failed computations leave no entry behind, so the next caller retries.
//! Counters for every cache are exposed through `StatsCollector`.

mod stats;
mod store;

pub use stats::{CacheStats, StatsCollector, StatsReport, StatsSnapshot};
pub use store::{Cache, CacheError};
