//! The upstream connector seam.
//!
//! [`UpstreamConnector`] abstracts the streaming engine behind
//! demand-driven chunk polling: the pipeline pulls, the connector
//! fetches. Both the snapshot and the subscription are finite-chunk
//! pull loops, which gives the consolidator natural backpressure — no
//! rows are prefetched beyond one chunk.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::event::RawRow;
use crate::value::ViewSchema;

/// Options for [`UpstreamConnector::subscribe`].
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Request progress marks. The consolidator cannot function without
    /// them, so pipelines always set this.
    pub with_progress: bool,
    /// Begin the subscription with the view's snapshot rows before
    /// transitioning into change rows.
    pub emit_snapshot: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            with_progress: true,
            emit_snapshot: true,
        }
    }
}

/// A logical connection to one upstream view.
///
/// # Lifecycle
///
/// 1. [`open`](Self::open) — connect and capture the view schema
/// 2. Either a snapshot pass
///    ([`begin_snapshot`](Self::begin_snapshot) +
///    [`poll_snapshot`](Self::poll_snapshot) until `None`) or directly
/// 3. [`subscribe`](Self::subscribe) +
///    [`poll_rows`](Self::poll_rows) in a loop
/// 4. [`close`](Self::close)
///
/// After a transient failure the same connector is reopened; `open`
/// must tolerate being called again after an error.
#[async_trait]
pub trait UpstreamConnector: Send {
    /// The view this connector is bound to.
    fn view(&self) -> &str;

    /// Connects and captures the view's schema.
    ///
    /// # Errors
    ///
    /// `NetworkUnavailable` for connect/transport failures,
    /// `AuthenticationFailed` for rejected credentials,
    /// `ViewNotFound` when the view does not exist.
    async fn open(&mut self) -> Result<Arc<ViewSchema>, SyncError>;

    /// Starts a standalone, restartable snapshot of the view.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error from the engine.
    async fn begin_snapshot(&mut self) -> Result<(), SyncError>;

    /// Pulls the next chunk of snapshot rows; `None` once the snapshot
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a transport error; the snapshot may be restarted via
    /// [`begin_snapshot`](Self::begin_snapshot).
    async fn poll_snapshot(&mut self, max_rows: usize)
        -> Result<Option<Vec<RawRow>>, SyncError>;

    /// Starts the differential subscription.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error from the engine.
    async fn subscribe(&mut self, options: SubscribeOptions) -> Result<(), SyncError>;

    /// Pulls the next chunk of raw subscription rows.
    ///
    /// May block until rows arrive or an engine-side poll interval
    /// elapses; an empty chunk means "nothing yet", not end-of-stream.
    ///
    /// # Errors
    ///
    /// `StreamEnded` when the engine terminates the subscription,
    /// `NetworkUnavailable` on transport failure.
    async fn poll_rows(&mut self, max_rows: usize) -> Result<Vec<RawRow>, SyncError>;

    /// Releases the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error; safe to ignore during shutdown.
    async fn close(&mut self) -> Result<(), SyncError>;
}
