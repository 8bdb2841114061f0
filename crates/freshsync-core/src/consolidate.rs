//! Transactional batch consolidation.
//!
//! The upstream engine emits raw +1/−1 changes; a DELETE-then-INSERT at
//! the same logical timestamp is how it spells UPDATE. [`Consolidator`]
//! buffers changes between progress marks and folds them into per-key
//! net operations, so sinks see one upsert or delete per key per
//! transaction — never the raw churn.

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::SyncError;
use crate::event::{Diff, SourceEvent};
use crate::value::Row;

/// One net operation of a flushed batch.
#[derive(Debug, Clone, PartialEq)]
pub enum NetOp {
    /// Insert or replace the row for `key`.
    Upsert {
        /// Row key.
        key: String,
        /// Latest payload for the key.
        row: Row,
    },
    /// Remove the row for `key`.
    Delete {
        /// Row key.
        key: String,
    },
}

impl NetOp {
    /// The key this operation applies to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            NetOp::Upsert { key, .. } | NetOp::Delete { key } => key,
        }
    }
}

/// A consolidated batch, emitted at a progress boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    /// Maximum change timestamp contained in the batch.
    pub ts: u64,
    /// Net operations in key order.
    pub ops: Vec<NetOp>,
}

impl FlushBatch {
    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` when the batch carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Default)]
struct Pending {
    net: i64,
    latest_ts: u64,
    inserted: Option<Row>,
    retracted: Option<Row>,
}

/// Folds decoded changes into [`FlushBatch`]es at progress marks.
///
/// Also enforces the stream's ordering contract: net diffs must stay
/// within ±1 per key per window, and timestamps must never regress
/// below an already-flushed batch.
#[derive(Debug)]
pub struct Consolidator {
    pending: BTreeMap<String, Pending>,
    /// Max change ts of the last flushed batch.
    watermark: Option<u64>,
    max_pending_keys: usize,
    saturated: bool,
}

impl Consolidator {
    /// Default bound on buffered keys between progress marks.
    pub const DEFAULT_MAX_PENDING_KEYS: usize = 100_000;

    /// Creates a consolidator with the given pending-key bound.
    #[must_use]
    pub fn new(max_pending_keys: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            watermark: None,
            max_pending_keys: max_pending_keys.max(1),
            saturated: false,
        }
    }

    /// Number of keys currently buffered.
    #[must_use]
    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` while the pending buffer exceeds its bound. The
    /// pipeline shrinks its upstream fetch to single rows until the
    /// next progress mark drains the buffer.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    /// Max change ts of the last flushed batch, if any.
    #[must_use]
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Feeds one decoded event; returns a batch when `event` is a
    /// progress mark with buffered changes behind it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnexpectedSnapshotRow`] for snapshot events (those
    ///   belong to the hydration phase).
    /// - [`SyncError::NonMonotonicTimestamp`] when a timestamp regresses
    ///   below the flushed watermark.
    /// - [`SyncError::NetDiffOverflow`] when a key's net diff leaves
    ///   {−1, 0, +1} within one window.
    pub fn observe(&mut self, event: SourceEvent) -> Result<Option<FlushBatch>, SyncError> {
        match event {
            SourceEvent::Snapshot { .. } => Err(SyncError::UnexpectedSnapshotRow),
            SourceEvent::Change { ts, diff, key, row } => {
                self.observe_change(ts, diff, key, row)?;
                Ok(None)
            }
            SourceEvent::Progress { ts } => self.flush(ts),
        }
    }

    /// Discards buffered state after a stream break. The timestamps of
    /// pending changes were never acknowledged by a progress mark, so
    /// they must not survive into the next session.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.watermark = None;
        self.saturated = false;
    }

    fn observe_change(
        &mut self,
        ts: u64,
        diff: Diff,
        key: String,
        row: Row,
    ) -> Result<(), SyncError> {
        if let Some(watermark) = self.watermark {
            if ts < watermark {
                return Err(SyncError::NonMonotonicTimestamp { ts, watermark });
            }
        }

        let entry = self.pending.entry(key.clone()).or_default();
        entry.net += diff.signum();
        if entry.net.abs() > 1 {
            return Err(SyncError::NetDiffOverflow(key));
        }
        if ts >= entry.latest_ts {
            entry.latest_ts = ts;
        }
        match diff {
            Diff::Insert => entry.inserted = Some(row),
            Diff::Retract => entry.retracted = Some(row),
        }

        if !self.saturated && self.pending.len() > self.max_pending_keys {
            self.saturated = true;
            warn!(
                pending = self.pending.len(),
                bound = self.max_pending_keys,
                "consolidator pending buffer exceeded bound; throttling upstream fetch until next progress mark"
            );
        }
        Ok(())
    }

    fn flush(&mut self, progress_ts: u64) -> Result<Option<FlushBatch>, SyncError> {
        if let Some(watermark) = self.watermark {
            if progress_ts < watermark {
                return Err(SyncError::NonMonotonicTimestamp {
                    ts: progress_ts,
                    watermark,
                });
            }
        }
        self.saturated = false;
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut batch_ts = 0u64;
        let mut ops = Vec::with_capacity(self.pending.len());
        for (key, pending) in std::mem::take(&mut self.pending) {
            batch_ts = batch_ts.max(pending.latest_ts);
            match pending.net {
                1 => {
                    let row = pending
                        .inserted
                        .ok_or_else(|| SyncError::NetDiffOverflow(key.clone()))?;
                    ops.push(NetOp::Upsert { key, row });
                }
                -1 => ops.push(NetOp::Delete { key }),
                0 => {
                    // DELETE-then-INSERT at the same ts: an update when
                    // the payload changed, a no-op otherwise.
                    if let (Some(inserted), Some(retracted)) =
                        (pending.inserted, pending.retracted.as_ref())
                    {
                        if inserted != *retracted {
                            ops.push(NetOp::Upsert { key, row: inserted });
                        }
                    }
                }
                _ => return Err(SyncError::NetDiffOverflow(key)),
            }
        }

        self.watermark = Some(batch_ts);
        if ops.is_empty() {
            return Ok(None);
        }
        Ok(Some(FlushBatch { ts: batch_ts, ops }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ColumnDef, ColumnType, ViewSchema};
    use std::sync::Arc;

    fn schema() -> Arc<ViewSchema> {
        Arc::new(ViewSchema::new(
            "orders",
            vec![
                ColumnDef::new("k", ColumnType::Text),
                ColumnDef::new("status", ColumnType::Text),
            ],
        ))
    }

    fn row(key: &str, status: &str) -> Row {
        Row::parse(&schema(), &[Some(key.to_string()), Some(status.to_string())])
            .unwrap()
    }

    fn change(ts: u64, diff: Diff, key: &str, status: &str) -> SourceEvent {
        SourceEvent::Change {
            ts,
            diff,
            key: key.to_string(),
            row: row(key, status),
        }
    }

    #[test]
    fn test_simple_upsert() {
        let mut c = Consolidator::new(100);
        assert!(c
            .observe(change(1, Diff::Insert, "o1", "NEW"))
            .unwrap()
            .is_none());
        let batch = c.observe(SourceEvent::Progress { ts: 1 }).unwrap().unwrap();
        assert_eq!(batch.ts, 1);
        assert_eq!(batch.ops.len(), 1);
        assert!(matches!(&batch.ops[0], NetOp::Upsert { key, .. } if key == "o1"));
    }

    #[test]
    fn test_delete_then_insert_is_update() {
        let mut c = Consolidator::new(100);
        c.observe(change(2, Diff::Retract, "o1", "NEW")).unwrap();
        c.observe(change(2, Diff::Insert, "o1", "PAID")).unwrap();
        let batch = c.observe(SourceEvent::Progress { ts: 2 }).unwrap().unwrap();
        assert_eq!(batch.ops.len(), 1);
        match &batch.ops[0] {
            NetOp::Upsert { key, row } => {
                assert_eq!(key, "o1");
                assert_eq!(row.get("status").unwrap().as_key().unwrap(), "PAID");
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_then_insert_same_payload_is_noop() {
        let mut c = Consolidator::new(100);
        c.observe(change(2, Diff::Retract, "o1", "NEW")).unwrap();
        c.observe(change(2, Diff::Insert, "o1", "NEW")).unwrap();
        assert!(c.observe(SourceEvent::Progress { ts: 2 }).unwrap().is_none());
        // The window still advances the watermark.
        assert_eq!(c.watermark(), Some(2));
    }

    #[test]
    fn test_consolidated_transaction() {
        // +a, +b, then −a within one window folds to Upsert(b) only.
        let mut c = Consolidator::new(100);
        c.observe(change(5, Diff::Insert, "a", "x")).unwrap();
        c.observe(change(5, Diff::Insert, "b", "y")).unwrap();
        c.observe(change(5, Diff::Retract, "a", "x")).unwrap();
        let batch = c.observe(SourceEvent::Progress { ts: 5 }).unwrap().unwrap();
        assert_eq!(batch.ops.len(), 1);
        assert_eq!(batch.ops[0].key(), "b");
    }

    #[test]
    fn test_net_delete() {
        let mut c = Consolidator::new(100);
        c.observe(change(3, Diff::Retract, "o1", "PAID")).unwrap();
        let batch = c.observe(SourceEvent::Progress { ts: 3 }).unwrap().unwrap();
        assert!(matches!(&batch.ops[0], NetOp::Delete { key } if key == "o1"));
    }

    #[test]
    fn test_ops_in_key_order() {
        let mut c = Consolidator::new(100);
        c.observe(change(1, Diff::Insert, "zebra", "1")).unwrap();
        c.observe(change(1, Diff::Insert, "apple", "2")).unwrap();
        c.observe(change(1, Diff::Insert, "mango", "3")).unwrap();
        let batch = c.observe(SourceEvent::Progress { ts: 1 }).unwrap().unwrap();
        let keys: Vec<&str> = batch.ops.iter().map(NetOp::key).collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn test_net_diff_overflow_detected() {
        let mut c = Consolidator::new(100);
        c.observe(change(1, Diff::Insert, "o1", "NEW")).unwrap();
        let err = c.observe(change(1, Diff::Insert, "o1", "NEW")).unwrap_err();
        assert!(matches!(err, SyncError::NetDiffOverflow(_)));
    }

    #[test]
    fn test_timestamp_regression_detected() {
        let mut c = Consolidator::new(100);
        c.observe(change(5, Diff::Insert, "o1", "NEW")).unwrap();
        c.observe(SourceEvent::Progress { ts: 5 }).unwrap();
        let err = c.observe(change(3, Diff::Insert, "o2", "NEW")).unwrap_err();
        assert!(matches!(
            err,
            SyncError::NonMonotonicTimestamp { ts: 3, watermark: 5 }
        ));
    }

    #[test]
    fn test_equal_ts_across_batches_allowed() {
        // Consecutive batches may touch: an equal ts across a flush is legal.
        let mut c = Consolidator::new(100);
        c.observe(change(5, Diff::Insert, "o1", "NEW")).unwrap();
        c.observe(SourceEvent::Progress { ts: 5 }).unwrap();
        assert!(c.observe(change(5, Diff::Insert, "o2", "NEW")).is_ok());
    }

    #[test]
    fn test_progress_without_pending_is_silent() {
        let mut c = Consolidator::new(100);
        assert!(c.observe(SourceEvent::Progress { ts: 9 }).unwrap().is_none());
    }

    #[test]
    fn test_latest_payload_wins() {
        // Two windows: NEW then PAID; the sink must see PAID last.
        let mut c = Consolidator::new(100);
        c.observe(change(1, Diff::Insert, "o1", "NEW")).unwrap();
        c.observe(SourceEvent::Progress { ts: 1 }).unwrap();
        c.observe(change(2, Diff::Retract, "o1", "NEW")).unwrap();
        c.observe(change(2, Diff::Insert, "o1", "PAID")).unwrap();
        let batch = c.observe(SourceEvent::Progress { ts: 2 }).unwrap().unwrap();
        match &batch.ops[0] {
            NetOp::Upsert { row, .. } => {
                assert_eq!(row.get("status").unwrap().as_key().unwrap(), "PAID");
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_saturation_watermark() {
        let mut c = Consolidator::new(2);
        c.observe(change(1, Diff::Insert, "a", "1")).unwrap();
        c.observe(change(1, Diff::Insert, "b", "2")).unwrap();
        assert!(!c.is_saturated());
        c.observe(change(1, Diff::Insert, "c", "3")).unwrap();
        assert!(c.is_saturated());
        c.observe(SourceEvent::Progress { ts: 1 }).unwrap();
        assert!(!c.is_saturated());
        assert_eq!(c.pending_keys(), 0);
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut c = Consolidator::new(100);
        c.observe(change(1, Diff::Insert, "o1", "NEW")).unwrap();
        c.reset();
        assert!(c.observe(SourceEvent::Progress { ts: 1 }).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_event_rejected() {
        let mut c = Consolidator::new(100);
        let err = c
            .observe(SourceEvent::Snapshot {
                key: "o1".into(),
                row: row("o1", "NEW"),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedSnapshotRow));
    }
}
