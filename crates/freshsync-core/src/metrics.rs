//! Per-pipeline counters.
//!
//! Lock-free counters updated by the supervisor and sink tasks, read by
//! the probe endpoints. A [`PipelineMetricsSnapshot`] is the consistent
//! point-in-time view handed to callers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one running pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Consolidated batches applied to the sink.
    pub batches_applied: AtomicU64,
    /// Net operations applied across all batches.
    pub ops_applied: AtomicU64,
    /// Snapshot rows ingested across all hydrations.
    pub snapshot_rows: AtomicU64,
    /// Completed hydration passes.
    pub hydrations: AtomicU64,
    /// Reconnect attempts.
    pub reconnects: AtomicU64,
    /// Highest batch timestamp applied to the sink.
    pub last_applied_ts: AtomicU64,
}

impl PipelineMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one applied batch.
    pub fn record_batch(&self, ops: u64, ts: u64) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.ops_applied.fetch_add(ops, Ordering::Relaxed);
        self.last_applied_ts.fetch_max(ts, Ordering::Relaxed);
    }

    /// Records ingested snapshot rows.
    pub fn record_snapshot_rows(&self, rows: u64) {
        self.snapshot_rows.fetch_add(rows, Ordering::Relaxed);
    }

    /// Records a completed hydration.
    pub fn record_hydration(&self) {
        self.hydrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            snapshot_rows: self.snapshot_rows.load(Ordering::Relaxed),
            hydrations: self.hydrations.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_applied_ts: self.last_applied_ts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    /// Consolidated batches applied.
    pub batches_applied: u64,
    /// Net operations applied.
    pub ops_applied: u64,
    /// Snapshot rows ingested.
    pub snapshot_rows: u64,
    /// Completed hydrations.
    pub hydrations: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Highest applied batch timestamp.
    pub last_applied_ts: u64,
}
