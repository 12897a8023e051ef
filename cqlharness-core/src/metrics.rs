//! Lifecycle Counters
//!
//! Lightweight bookkeeping of what the harness actually did during a test
//! run: how many engines were started and how long that took, how many ports
//! were allocated, how many statements were replayed.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Safe to share between the orchestrator, the shutdown registry and tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters shared by every harness component.
#[derive(Default)]
pub struct HarnessMetrics {
    pub engine_starts: AtomicU64,
    pub engine_start_time_ns: AtomicU64,

    pub port_allocation_rounds: AtomicU64,
    pub ports_allocated: AtomicU64,

    pub keyspace_ensures: AtomicU64,
    pub scripts_replayed: AtomicU64,
    pub statements_executed: AtomicU64,

    pub resources_closed: AtomicU64,
    pub close_failures: AtomicU64,
}

impl HarnessMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a completed engine start
    pub fn record_engine_start(&self, duration: Duration) {
        self.engine_starts.fetch_add(1, Ordering::Relaxed);
        self.engine_start_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record one port resolution round and the number of ports it allocated
    pub fn record_port_allocation(&self, allocated: usize) {
        self.port_allocation_rounds.fetch_add(1, Ordering::Relaxed);
        self.ports_allocated
            .fetch_add(allocated as u64, Ordering::Relaxed);
    }

    pub fn record_keyspace_ensure(&self) {
        self.keyspace_ensures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_script_replayed(&self) {
        self.scripts_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_statement(&self) {
        self.statements_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resource_closed(&self) {
        self.resources_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close_failure(&self) {
        self.close_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let engine_starts = self.engine_starts.load(Ordering::Relaxed);
        let total_ns = self.engine_start_time_ns.load(Ordering::Relaxed);
        let avg_engine_start_ms = if engine_starts == 0 {
            0.0
        } else {
            (total_ns as f64) / (engine_starts as f64) / 1_000_000.0
        };

        MetricsSnapshot {
            engine_starts,
            avg_engine_start_ms,
            port_allocation_rounds: self.port_allocation_rounds.load(Ordering::Relaxed),
            ports_allocated: self.ports_allocated.load(Ordering::Relaxed),
            keyspace_ensures: self.keyspace_ensures.load(Ordering::Relaxed),
            scripts_replayed: self.scripts_replayed.load(Ordering::Relaxed),
            statements_executed: self.statements_executed.load(Ordering::Relaxed),
            resources_closed: self.resources_closed.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`HarnessMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub engine_starts: u64,
    pub avg_engine_start_ms: f64,
    pub port_allocation_rounds: u64,
    pub ports_allocated: u64,
    pub keyspace_ensures: u64,
    pub scripts_replayed: u64,
    pub statements_executed: u64,
    pub resources_closed: u64,
    pub close_failures: u64,
}

/// Records the elapsed time of an engine start when dropped.
pub struct EngineStartTimer<'a> {
    start: Instant,
    metrics: &'a HarnessMetrics,
    armed: bool,
}

impl<'a> EngineStartTimer<'a> {
    pub fn new(metrics: &'a HarnessMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            armed: true,
        }
    }

    /// Do not record anything; the start did not complete.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for EngineStartTimer<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.metrics.record_engine_start(self.start.elapsed());
        }
    }
}
