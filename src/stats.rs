use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total connections accepted on all listeners
    pub connections_accepted: u64,
    /// Connection pairs currently owned by workers
    pub active_pairs: u64,
    /// Connection pairs handed off to workers
    pub pairs_registered: u64,
    /// Outbound connects that failed
    pub connect_failures: u64,
    /// Bytes relayed from clients to remotes
    pub bytes_upstream: u64,
    /// Bytes relayed from remotes to clients
    pub bytes_downstream: u64,
    /// Times a read side was paused for a slow consumer
    pub backpressure_pauses: u64,
    /// Pending buffers currently parked waiting for write readiness
    pub pending_buffers: u64,
    /// Detected internal-consistency violations
    pub invariant_violations: u64,
    /// Unix timestamp when the stats were created
    pub start_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections_accepted: AtomicU64,
    active_pairs: AtomicU64,
    pairs_registered: AtomicU64,
    connect_failures: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    backpressure_pauses: AtomicU64,
    pending_buffers: AtomicU64,
    invariant_violations: AtomicU64,
}

/// Shared relay statistics tracker
#[derive(Debug, Clone)]
pub struct RelayStats {
    counters: Arc<Counters>,
    start_time: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Called by the accept handler for every accepted socket
    pub fn connection_accepted(&self) {
        self.counters
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Called when a worker takes ownership of a pair
    pub fn pair_registered(&self) {
        self.counters.pairs_registered.fetch_add(1, Ordering::Relaxed);
        self.counters.active_pairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Called when a worker closes a pair
    pub fn pair_closed(&self) {
        self.counters.active_pairs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.counters
            .bytes_upstream
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.counters
            .bytes_downstream
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// A chunk was parked and the read side paused
    pub fn buffer_parked(&self) {
        self.counters
            .backpressure_pauses
            .fetch_add(1, Ordering::Relaxed);
        self.counters.pending_buffers.fetch_add(1, Ordering::Relaxed);
    }

    /// A parked chunk was flushed or discarded
    pub fn buffer_released(&self) {
        self.counters.pending_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn invariant_violated(&self) {
        self.counters
            .invariant_violations
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
            active_pairs: c.active_pairs.load(Ordering::Relaxed),
            pairs_registered: c.pairs_registered.load(Ordering::Relaxed),
            connect_failures: c.connect_failures.load(Ordering::Relaxed),
            bytes_upstream: c.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: c.bytes_downstream.load(Ordering::Relaxed),
            backpressure_pauses: c.backpressure_pauses.load(Ordering::Relaxed),
            pending_buffers: c.pending_buffers.load(Ordering::Relaxed),
            invariant_violations: c.invariant_violations.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
