use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Monotonic pool counters.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) total_requests: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) connection_errors: AtomicU64,
    pub(crate) peak_size: AtomicUsize,
}

impl PoolCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_size(&self, size: usize) {
        self.peak_size.fetch_max(size, Ordering::SeqCst);
    }
}

/// Snapshot returned by [`LinkPool::stats`](super::LinkPool::stats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    /// Established links, leased or free.
    pub size: usize,
    /// Links being opened right now.
    pub connecting: usize,
    pub reserved: usize,
    pub free: usize,
    /// Established links grouped by link state.
    pub by_state: BTreeMap<String, usize>,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub connection_errors: u64,
    /// Percentage of requests served by an open link.
    pub hit_rate: f64,
    /// Percentage of requests that failed to open a link.
    pub error_rate: f64,
    pub peak_size: usize,
    pub uptime_secs: u64,
    pub max_size: usize,
    pub min_size: usize,
    pub max_concurrent_connections: usize,
    pub available_permits: usize,
    pub running: bool,
}

impl PoolStats {
    pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
        if whole == 0 {
            0.0
        } else {
            part as f64 * 100.0 / whole as f64
        }
    }
}
