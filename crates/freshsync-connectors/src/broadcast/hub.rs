//! Per-view broadcast state and fan-out.
//!
//! The hub holds one [`ViewChannel`] per view. A channel keeps the
//! view's current `key → payload` map so freshly connected clients get
//! a snapshot without touching upstream, plus the subscriber set.
//!
//! Lock discipline: the pipeline's sink task is the only writer; the
//! snapshot assembler and fan-out read under the same lock so a
//! snapshot is always atomic with `last_applied_ts`. The write lock is
//! held only long enough to apply one batch. Enqueueing to clients is a
//! `try_send` — a full queue evicts that client, never stalls the
//! pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use tungstenite::Utf8Bytes;

use freshsync_core::consolidate::{FlushBatch, NetOp};
use freshsync_core::error::SyncError;
use freshsync_core::value::Row;

use super::protocol::{encode_frame, DeltaUpsert, ServerFrame, SnapshotEntry};

/// Unique identifier of one client session.
pub type ClientId = u64;

/// Counters for the broadcaster.
#[derive(Debug, Default)]
pub struct BroadcastMetrics {
    /// Sessions accepted over the process lifetime.
    pub sessions_total: AtomicU64,
    /// Currently connected sessions.
    pub clients_connected: AtomicU64,
    /// Frames enqueued to clients.
    pub frames_enqueued: AtomicU64,
    /// Frames dropped because a client queue was full.
    pub frames_dropped: AtomicU64,
    /// Sessions terminated for falling behind.
    pub slow_consumer_kicks: AtomicU64,
}

/// One subscribed client of one view.
#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Utf8Bytes>,
    kill: watch::Sender<Option<String>>,
    /// Deltas with `ts <= snapshot_ts` are already reflected in the
    /// snapshot this client received.
    snapshot_ts: u64,
}

#[derive(Debug, Default)]
struct ViewState {
    rows: HashMap<String, serde_json::Value>,
    /// Rehydration staging; live `rows` keep serving until the swap.
    staged: Option<HashMap<String, serde_json::Value>>,
    last_applied_ts: u64,
    hydrated: bool,
    subscribers: HashMap<ClientId, Subscriber>,
}

/// Broadcast state of a single view.
#[derive(Debug)]
pub struct ViewChannel {
    view: String,
    state: RwLock<ViewState>,
    metrics: Arc<BroadcastMetrics>,
}

impl ViewChannel {
    fn new(view: String, metrics: Arc<BroadcastMetrics>) -> Self {
        Self {
            view,
            state: RwLock::new(ViewState::default()),
            metrics,
        }
    }

    /// The view this channel serves.
    #[must_use]
    pub fn view(&self) -> &str {
        &self.view
    }

    /// Number of subscribed clients.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// Number of rows currently held.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Timestamp of the last applied batch (or hydration cutoff).
    #[must_use]
    pub fn last_applied_ts(&self) -> u64 {
        self.state.read().last_applied_ts
    }

    /// Whether the first hydration has completed.
    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.state.read().hydrated
    }

    /// Starts staging a (re)hydration snapshot.
    pub fn hydrate_begin(&self) {
        self.state.write().staged = Some(HashMap::new());
    }

    /// Stages one chunk of snapshot rows.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShapeError`] when a row has no JSON
    /// representation.
    pub fn hydrate_rows(&self, rows: Vec<(String, Row)>) -> Result<(), SyncError> {
        // Shape outside the lock; only the inserts need it.
        let mut shaped = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            shaped.push((key, serde_json::Value::Object(row.to_json_object(false)?)));
        }
        let mut state = self.state.write();
        let staged = state.staged.get_or_insert_with(HashMap::new);
        staged.extend(shaped);
        Ok(())
    }

    /// Swaps the staged snapshot live. `cutoff_ts` is the first
    /// progress mark after the snapshot; `last_applied_ts` backs off to
    /// `cutoff_ts - 1` so the first post-cutoff batch is fanned out.
    ///
    /// Subscribers from before the swap are evicted: the swap can
    /// contain changes that were never sent as deltas (anything that
    /// happened while upstream was unreachable), and a client gets
    /// exactly one snapshot per session. Evicted clients reconnect and
    /// receive the fresh snapshot.
    pub fn hydrate_end(&self, cutoff_ts: u64) {
        let mut state = self.state.write();
        if let Some(staged) = state.staged.take() {
            state.rows = staged;
        }
        state.last_applied_ts = cutoff_ts.saturating_sub(1);
        state.hydrated = true;
        let evicted = state.subscribers.len();
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber.kill.send(Some("rehydrated".to_string()));
        }
        debug!(
            view = %self.view,
            rows = state.rows.len(),
            cutoff_ts,
            evicted,
            "broadcast state hydrated"
        );
    }

    /// Applies one batch: updates the state map, then fans the delta
    /// frame out to every subscriber past its snapshot cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShapeError`] when an upserted row has no
    /// JSON representation.
    pub fn apply(&self, batch: &FlushBatch) -> Result<(), SyncError> {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for op in &batch.ops {
            match op {
                NetOp::Upsert { key, row } => upserts.push(DeltaUpsert {
                    key: key.clone(),
                    row: serde_json::Value::Object(row.to_json_object(false)?),
                }),
                NetOp::Delete { key } => deletes.push(key.clone()),
            }
        }
        let frame = encode_frame(&ServerFrame::Delta {
            view: self.view.clone(),
            upserts: upserts.clone(),
            deletes: deletes.clone(),
            ts: batch.ts,
        })?;

        let mut state = self.state.write();
        for upsert in upserts {
            state.rows.insert(upsert.key, upsert.row);
        }
        for key in &deletes {
            state.rows.remove(key);
        }
        state.last_applied_ts = batch.ts;

        let mut slow = Vec::new();
        let mut gone = Vec::new();
        for (&id, subscriber) in &state.subscribers {
            if batch.ts <= subscriber.snapshot_ts {
                continue;
            }
            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => {
                    self.metrics.frames_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }
        for id in slow {
            if let Some(subscriber) = state.subscribers.remove(&id) {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .slow_consumer_kicks
                    .fetch_add(1, Ordering::Relaxed);
                warn!(view = %self.view, client = id, "evicting slow consumer");
                let _ = subscriber.kill.send(Some("slow_consumer".to_string()));
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
        }
        Ok(())
    }

    /// Subscribes a client: enqueues the snapshot frames and registers
    /// the client at the current cutoff, atomically with the state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SlowConsumer`] when the snapshot does not
    /// fit the client's queue; the caller must terminate the session.
    pub fn subscribe(
        &self,
        client_id: ClientId,
        tx: mpsc::Sender<Utf8Bytes>,
        kill: watch::Sender<Option<String>>,
        chunk_rows: usize,
    ) -> Result<(), SyncError> {
        let chunk_rows = chunk_rows.max(1);
        let mut state = self.state.write();

        let entries: Vec<SnapshotEntry> = state
            .rows
            .iter()
            .map(|(key, row)| SnapshotEntry {
                key: key.clone(),
                row: row.clone(),
            })
            .collect();
        let mut frames = Vec::with_capacity(entries.len() / chunk_rows + 2);
        for chunk in entries.chunks(chunk_rows) {
            frames.push(encode_frame(&ServerFrame::Snapshot {
                view: self.view.clone(),
                rows: chunk.to_vec(),
            })?);
        }
        frames.push(encode_frame(&ServerFrame::SnapshotEnd {
            view: self.view.clone(),
        })?);

        for frame in frames {
            if tx.try_send(frame).is_err() {
                return Err(SyncError::SlowConsumer(client_id));
            }
            self.metrics.frames_enqueued.fetch_add(1, Ordering::Relaxed);
        }

        let snapshot_ts = state.last_applied_ts;
        state.subscribers.insert(
            client_id,
            Subscriber {
                tx,
                kill,
                snapshot_ts,
            },
        );
        debug!(view = %self.view, client = client_id, snapshot_ts, "client subscribed");
        Ok(())
    }

    /// Removes a client's subscription, if present.
    pub fn unsubscribe(&self, client_id: ClientId) {
        self.state.write().subscribers.remove(&client_id);
    }

    /// Evicts every subscriber with the given reason.
    pub fn kick_all(&self, reason: &str) {
        let mut state = self.state.write();
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber.kill.send(Some(reason.to_string()));
        }
    }
}

/// Registry of view channels plus broadcaster-wide counters.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    views: RwLock<HashMap<String, Arc<ViewChannel>>>,
    next_client_id: AtomicU64,
    metrics: Arc<BroadcastMetrics>,
}

impl BroadcastHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel for `view`, creating it if needed.
    #[must_use]
    pub fn register_view(&self, view: &str) -> Arc<ViewChannel> {
        let mut views = self.views.write();
        Arc::clone(views.entry(view.to_string()).or_insert_with(|| {
            Arc::new(ViewChannel::new(
                view.to_string(),
                Arc::clone(&self.metrics),
            ))
        }))
    }

    /// Looks up a channel without creating it.
    #[must_use]
    pub fn get_view(&self, view: &str) -> Option<Arc<ViewChannel>> {
        self.views.read().get(view).map(Arc::clone)
    }

    /// Registered view names.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        self.views.read().keys().cloned().collect()
    }

    /// Allocates the next client id.
    #[must_use]
    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Handle to the broadcaster counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<BroadcastMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Evicts every subscriber of every view (controlled shutdown).
    pub fn kick_all(&self, reason: &str) {
        for channel in self.views.read().values() {
            channel.kick_all(reason);
        }
    }
}
