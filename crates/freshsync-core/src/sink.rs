//! The sink adapter seam.

use async_trait::async_trait;

use crate::consolidate::FlushBatch;
use crate::error::SyncError;
use crate::value::{Row, ViewSchema};

/// A downstream sink for one view's consolidated changes.
///
/// Hydration is chunked: `hydrate_begin` → any number of
/// `hydrate_rows` → `hydrate_end`. During rehydration the sink must
/// keep serving reads from its previous state; the new snapshot only
/// becomes visible at `hydrate_end`.
///
/// Applying the same [`FlushBatch`] twice must leave the sink in the
/// same state — the supervisor leans on this for reconnects.
#[async_trait]
pub trait SinkAdapter: Send {
    /// Short sink name for logs and probes (e.g. `"search"`).
    fn name(&self) -> &'static str;

    /// Starts a (re)hydration pass.
    ///
    /// # Errors
    ///
    /// Returns a transient error to trigger a supervisor retry, or a
    /// fatal error to halt the pipeline.
    async fn hydrate_begin(&mut self, schema: &ViewSchema) -> Result<(), SyncError>;

    /// Ingests one chunk of snapshot rows.
    ///
    /// # Errors
    ///
    /// Same contract as [`hydrate_begin`](Self::hydrate_begin).
    async fn hydrate_rows(&mut self, rows: Vec<(String, Row)>) -> Result<(), SyncError>;

    /// Completes hydration. `cutoff_ts` is the first progress mark after
    /// the snapshot (0 when unknown); deltas at or above it are still
    /// forwarded to consumers that were connected before rehydration.
    ///
    /// # Errors
    ///
    /// Same contract as [`hydrate_begin`](Self::hydrate_begin).
    async fn hydrate_end(&mut self, cutoff_ts: u64) -> Result<(), SyncError>;

    /// Applies one consolidated batch.
    ///
    /// # Errors
    ///
    /// Transient errors trigger reconnect-and-rehydrate; per-item
    /// rejections are absorbed by the implementation and do not
    /// surface here.
    async fn apply(&mut self, batch: &FlushBatch) -> Result<(), SyncError>;

    /// Flushes and releases sink resources.
    ///
    /// # Errors
    ///
    /// Returns a transport error; safe to ignore during shutdown.
    async fn close(&mut self) -> Result<(), SyncError>;
}
