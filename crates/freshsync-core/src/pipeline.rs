//! Pipeline supervision.
//!
//! One [`Pipeline`] drives a single `(view, sink)` pair: it owns the
//! upstream connector, runs the decode→consolidate chain in its own
//! task, and feeds the sink adapter through a bounded command channel.
//! The sink runs in a separate task so slow sink I/O backpressures the
//! pipeline through the channel instead of blocking the stream reader
//! mid-chunk.
//!
//! The supervisor loop owns reconnect policy: transient errors tear the
//! session down, wait out a backoff, and rehydrate from a fresh
//! snapshot (sinks are idempotent, so rehydration repairs any drift).
//! Protocol and shape errors halt the pipeline and surface through its
//! [`PipelineStatus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::consolidate::{Consolidator, FlushBatch};
use crate::decode::RowDecoder;
use crate::error::SyncError;
use crate::event::{Diff, SourceEvent};
use crate::health::HealthStatus;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use crate::sink::SinkAdapter;
use crate::source::{SubscribeOptions, UpstreamConnector};
use crate::value::{Row, ViewSchema};

/// How the sink's initial state is produced on (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationMode {
    /// Hydrate from the subscription's own snapshot phase; the first
    /// progress mark is the cutoff. Snapshot and stream share one
    /// timeline, so no change can fall into a gap.
    SubscribeSnapshot,
    /// Hydrate from a standalone snapshot statement, then subscribe
    /// without snapshot. Restartable, but changes committed between the
    /// snapshot and the subscription are only repaired by the next
    /// rehydration.
    SelectSnapshot,
}

/// Tunables for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the supervisor→sink command channel.
    pub channel_capacity: usize,
    /// Rows pulled from upstream per poll.
    pub fetch_chunk: usize,
    /// Consolidator pending-key bound.
    pub max_pending_keys: usize,
    /// Hydration strategy.
    pub hydration: HydrationMode,
    /// Reconnect backoff schedule.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            fetch_chunk: 1024,
            max_pending_keys: Consolidator::DEFAULT_MAX_PENDING_KEYS,
            hydration: HydrationMode::SubscribeSnapshot,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, not yet connected.
    Initializing,
    /// Populating the sink from a snapshot.
    Hydrating,
    /// Applying live batches.
    Streaming,
    /// Backing off after a transient failure.
    Reconnecting,
    /// Halted on a fatal error; only this pipeline is affected.
    Fatal,
    /// Shut down by the orchestrator.
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Initializing => "Initializing",
            PipelineState::Hydrating => "Hydrating",
            PipelineState::Streaming => "Streaming",
            PipelineState::Reconnecting => "Reconnecting",
            PipelineState::Fatal => "Fatal",
            PipelineState::Stopped => "Stopped",
        };
        write!(f, "{name}")
    }
}

/// Shared status handle for one pipeline, read by the orchestrator's
/// probe endpoints.
#[derive(Debug)]
pub struct PipelineStatus {
    view: String,
    sink: String,
    state: Mutex<PipelineState>,
    last_error: Mutex<Option<String>>,
    hydrated_once: AtomicBool,
    /// Counters updated by the supervisor and sink tasks.
    pub metrics: PipelineMetrics,
}

impl PipelineStatus {
    /// Creates a status handle for a `(view, sink)` pair.
    #[must_use]
    pub fn new(view: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            sink: sink.into(),
            state: Mutex::new(PipelineState::Initializing),
            last_error: Mutex::new(None),
            hydrated_once: AtomicBool::new(false),
            metrics: PipelineMetrics::new(),
        }
    }

    /// The upstream view.
    #[must_use]
    pub fn view(&self) -> &str {
        &self.view
    }

    /// The sink name.
    #[must_use]
    pub fn sink(&self) -> &str {
        &self.sink
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Most recent error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether at least one hydration has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.hydrated_once.load(Ordering::Relaxed)
    }

    /// Maps the lifecycle state onto a probe health status.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        match self.state() {
            PipelineState::Streaming => HealthStatus::Healthy,
            PipelineState::Initializing | PipelineState::Hydrating => HealthStatus::Unknown,
            PipelineState::Reconnecting => HealthStatus::Degraded(
                self.last_error().unwrap_or_else(|| "reconnecting".to_string()),
            ),
            PipelineState::Fatal => HealthStatus::Unhealthy(
                self.last_error().unwrap_or_else(|| "fatal".to_string()),
            ),
            PipelineState::Stopped => HealthStatus::Unhealthy("stopped".to_string()),
        }
    }

    /// Records a lifecycle transition. Driven by the supervisor; also
    /// usable by an orchestrator that detects a dead pipeline task.
    pub fn set_state(&self, state: PipelineState) {
        *self.state.lock() = state;
    }

    /// Records the most recent error.
    pub fn set_error(&self, error: &SyncError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Marks the first completed hydration.
    pub fn mark_hydrated(&self) {
        self.hydrated_once.store(true, Ordering::Relaxed);
    }
}

/// Commands flowing supervisor → sink task. Each carries the session
/// epoch so stale work from a torn-down session is never confused with
/// the current one.
#[derive(Debug)]
enum SinkCommand {
    HydrateBegin {
        epoch: u64,
        schema: Arc<ViewSchema>,
    },
    HydrateRows {
        epoch: u64,
        rows: Vec<(String, Row)>,
    },
    HydrateEnd {
        epoch: u64,
        cutoff_ts: u64,
    },
    Apply {
        epoch: u64,
        batch: FlushBatch,
    },
}

impl SinkCommand {
    fn epoch(&self) -> u64 {
        match self {
            SinkCommand::HydrateBegin { epoch, .. }
            | SinkCommand::HydrateRows { epoch, .. }
            | SinkCommand::HydrateEnd { epoch, .. }
            | SinkCommand::Apply { epoch, .. } => *epoch,
        }
    }
}

/// Replies flowing sink task → supervisor.
#[derive(Debug)]
enum SinkReply {
    Hydrated { epoch: u64 },
    Applied { epoch: u64, ts: u64, ops: usize },
    Failed { epoch: u64, error: SyncError },
}

/// Supervisor-side handle to the sink task.
struct SinkClient {
    tx: mpsc::Sender<SinkCommand>,
    rx: mpsc::UnboundedReceiver<SinkReply>,
    epoch: u64,
    applied_batches: u64,
    status: Arc<PipelineStatus>,
}

impl SinkClient {
    /// Harvests pending replies without blocking. The first failure of
    /// the current epoch is propagated.
    fn drain_replies(&mut self) -> Result<(), SyncError> {
        loop {
            match self.rx.try_recv() {
                Ok(reply) => self.absorb(reply)?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(SyncError::Cancelled),
            }
        }
    }

    fn absorb(&mut self, reply: SinkReply) -> Result<(), SyncError> {
        match reply {
            SinkReply::Applied { epoch, ts, ops } if epoch == self.epoch => {
                self.applied_batches += 1;
                self.status.metrics.record_batch(ops as u64, ts);
                Ok(())
            }
            SinkReply::Failed { epoch, error } if epoch == self.epoch => Err(error),
            // Replies from a torn-down session: already handled.
            SinkReply::Hydrated { .. }
            | SinkReply::Applied { .. }
            | SinkReply::Failed { .. } => Ok(()),
        }
    }

    async fn send(&mut self, command: SinkCommand) -> Result<(), SyncError> {
        self.drain_replies()?;
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    async fn hydrate_begin(&mut self, schema: Arc<ViewSchema>) -> Result<(), SyncError> {
        let epoch = self.epoch;
        self.send(SinkCommand::HydrateBegin { epoch, schema }).await
    }

    async fn hydrate_rows(&mut self, rows: Vec<(String, Row)>) -> Result<(), SyncError> {
        let epoch = self.epoch;
        self.send(SinkCommand::HydrateRows { epoch, rows }).await
    }

    async fn hydrate_end(&mut self, cutoff_ts: u64) -> Result<(), SyncError> {
        let epoch = self.epoch;
        self.send(SinkCommand::HydrateEnd { epoch, cutoff_ts }).await
    }

    async fn apply(&mut self, batch: FlushBatch) -> Result<(), SyncError> {
        let epoch = self.epoch;
        self.send(SinkCommand::Apply { epoch, batch }).await
    }

    /// Blocks until the sink confirms the current epoch's hydration.
    async fn wait_hydrated(&mut self) -> Result<(), SyncError> {
        loop {
            match self.rx.recv().await {
                None => return Err(SyncError::Cancelled),
                Some(SinkReply::Hydrated { epoch }) if epoch == self.epoch => return Ok(()),
                Some(reply) => self.absorb(reply)?,
            }
        }
    }
}

/// One supervised `(view, sink)` pipeline.
pub struct Pipeline<C: UpstreamConnector> {
    connector: C,
    key_column: String,
    config: PipelineConfig,
    status: Arc<PipelineStatus>,
    shutdown: watch::Receiver<bool>,
}

impl<C: UpstreamConnector> Pipeline<C> {
    /// Creates a pipeline around an upstream connector.
    #[must_use]
    pub fn new(
        connector: C,
        key_column: impl Into<String>,
        config: PipelineConfig,
        status: Arc<PipelineStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            key_column: key_column.into(),
            config,
            status,
            shutdown,
        }
    }

    /// Runs the pipeline until cancellation or a fatal error.
    ///
    /// The sink adapter is moved into its own task and driven through a
    /// bounded command channel; the supervisor loop reconnects on
    /// transient errors with exponential backoff, resetting the backoff
    /// whenever a batch lands in the sink.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that halted the pipeline. Cancellation is
    /// a clean `Ok(())`.
    pub async fn run(mut self, sink: Box<dyn SinkAdapter>) -> Result<(), SyncError> {
        let sink_name = sink.name();
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.channel_capacity);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let sink_handle = tokio::spawn(run_sink_task(sink, cmd_rx, reply_tx));

        let mut client = SinkClient {
            tx: cmd_tx,
            rx: reply_rx,
            epoch: 0,
            applied_batches: 0,
            status: Arc::clone(&self.status),
        };
        let mut backoff = self.config.retry.backoff();

        info!(view = %self.status.view(), sink = sink_name, "pipeline starting");

        let result = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }
            client.epoch += 1;
            let applied_before = client.applied_batches;

            match self.run_session(&mut client).await {
                Ok(()) => break Ok(()),
                Err(error) if error.is_transient() => {
                    let _ = self.connector.close().await;
                    self.status.metrics.record_reconnect();
                    self.status.set_error(&error);
                    self.status.set_state(PipelineState::Reconnecting);
                    if client.applied_batches > applied_before {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        view = %self.status.view(),
                        sink = sink_name,
                        kind = error.kind(),
                        error = %error,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        attempt = backoff.attempts(),
                        "transient pipeline error; reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break Ok(()),
                    }
                }
                Err(error) => {
                    error!(
                        view = %self.status.view(),
                        sink = sink_name,
                        kind = error.kind(),
                        error = %error,
                        "fatal pipeline error; halting"
                    );
                    self.status.set_error(&error);
                    self.status.set_state(PipelineState::Fatal);
                    break Err(error);
                }
            }
        };

        let _ = self.connector.close().await;
        drop(client); // closes the command channel; the sink task drains and closes the sink
        let _ = sink_handle.await;
        if self.status.state() != PipelineState::Fatal {
            self.status.set_state(PipelineState::Stopped);
        }
        info!(view = %self.status.view(), sink = sink_name, state = %self.status.state(), "pipeline finished");
        result
    }

    /// One connect→hydrate→stream session. Returns `Ok(())` only on
    /// cancellation.
    async fn run_session(&mut self, client: &mut SinkClient) -> Result<(), SyncError> {
        self.status.set_state(PipelineState::Hydrating);

        let schema = self.connector.open().await?;
        let decoder = RowDecoder::new(Arc::clone(&schema), &self.key_column)?;
        let mut consolidator = Consolidator::new(self.config.max_pending_keys);

        client.hydrate_begin(Arc::clone(&schema)).await?;
        let (cutoff_ts, carried) = match self.config.hydration {
            HydrationMode::SelectSnapshot => (self.hydrate_from_select(&decoder, client).await?, Vec::new()),
            HydrationMode::SubscribeSnapshot => {
                match self.hydrate_from_subscription(&decoder, client).await? {
                    Some(done) => done,
                    None => return Ok(()), // cancelled mid-hydration
                }
            }
        };
        client.hydrate_end(cutoff_ts).await?;
        tokio::select! {
            hydrated = client.wait_hydrated() => hydrated?,
            _ = self.shutdown.changed() => return Ok(()),
        }
        self.status.mark_hydrated();
        self.status.metrics.record_hydration();
        self.status.set_state(PipelineState::Streaming);
        debug!(view = %self.status.view(), cutoff_ts, "hydration complete; streaming");

        // Changes decoded past the cutoff during the snapshot fetch.
        for event in carried {
            if let Some(batch) = consolidator.observe(event)? {
                client.apply(batch).await?;
            }
        }

        let fetch_chunk = self.config.fetch_chunk;
        let connector = &mut self.connector;
        let shutdown = &mut self.shutdown;
        loop {
            client.drain_replies()?;
            // While the consolidator is over its pending bound, inch
            // toward the next progress mark one row at a time instead of
            // prefetching whole chunks.
            let max_rows = if consolidator.is_saturated() {
                1
            } else {
                fetch_chunk
            };
            let raws = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                polled = connector.poll_rows(max_rows) => polled?,
            };
            for raw in raws {
                let event = decoder.decode(raw)?;
                if matches!(event, SourceEvent::Snapshot { .. }) {
                    return Err(SyncError::UnexpectedSnapshotRow);
                }
                if let Some(batch) = consolidator.observe(event)? {
                    client.apply(batch).await?;
                }
            }
        }
    }

    /// Hydrates from a standalone snapshot, then subscribes. The cutoff
    /// is unknown in this mode (0).
    async fn hydrate_from_select(
        &mut self,
        decoder: &RowDecoder,
        client: &mut SinkClient,
    ) -> Result<u64, SyncError> {
        self.connector.begin_snapshot().await?;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some(chunk) = self.connector.poll_snapshot(self.config.fetch_chunk).await? else {
                break;
            };
            let mut rows = Vec::with_capacity(chunk.len());
            for raw in chunk {
                match decoder.decode(raw)? {
                    SourceEvent::Snapshot { key, row } => rows.push((key, row)),
                    SourceEvent::Progress { .. } | SourceEvent::Change { .. } => {
                        return Err(SyncError::UnexpectedSnapshotRow);
                    }
                }
            }
            self.status.metrics.record_snapshot_rows(rows.len() as u64);
            client.hydrate_rows(rows).await?;
        }
        self.connector
            .subscribe(SubscribeOptions {
                with_progress: true,
                emit_snapshot: false,
            })
            .await?;
        Ok(0)
    }

    /// Subscribes with snapshot and hydrates from the stream's snapshot
    /// phase. Returns the cutoff (the first progress mark) plus any
    /// change events decoded past it, or `None` on cancellation.
    async fn hydrate_from_subscription(
        &mut self,
        decoder: &RowDecoder,
        client: &mut SinkClient,
    ) -> Result<Option<(u64, Vec<SourceEvent>)>, SyncError> {
        self.connector
            .subscribe(SubscribeOptions {
                with_progress: true,
                emit_snapshot: true,
            })
            .await?;

        let mut carried = Vec::new();
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }
            let raws = self.connector.poll_rows(self.config.fetch_chunk).await?;
            let mut rows = Vec::new();
            let mut cutoff = None;
            for raw in raws {
                let event = decoder.decode(raw)?;
                if cutoff.is_some() {
                    carried.push(event);
                    continue;
                }
                match event {
                    SourceEvent::Snapshot { key, row } => rows.push((key, row)),
                    // Some engines tag snapshot rows as +1 changes at the
                    // initial timestamp; they hydrate the same way.
                    SourceEvent::Change {
                        diff: Diff::Insert,
                        key,
                        row,
                        ..
                    } => rows.push((key, row)),
                    SourceEvent::Change {
                        diff: Diff::Retract,
                        key,
                        ..
                    } => {
                        return Err(SyncError::UnexpectedDiff { key, diff: -1 });
                    }
                    SourceEvent::Progress { ts } => cutoff = Some(ts),
                }
            }
            if !rows.is_empty() {
                self.status.metrics.record_snapshot_rows(rows.len() as u64);
                client.hydrate_rows(rows).await?;
            }
            if let Some(ts) = cutoff {
                return Ok(Some((ts, carried)));
            }
        }
    }
}

/// The sink task: executes commands in order, reporting failures
/// without dying. After a failure it skips the remainder of that
/// epoch's commands; the next `HydrateBegin` (a new session) resumes
/// normal processing.
async fn run_sink_task(
    mut sink: Box<dyn SinkAdapter>,
    mut rx: mpsc::Receiver<SinkCommand>,
    tx: mpsc::UnboundedSender<SinkReply>,
) {
    let mut failed_epoch: Option<u64> = None;
    while let Some(command) = rx.recv().await {
        if matches!(command, SinkCommand::HydrateBegin { .. }) {
            failed_epoch = None;
        } else if failed_epoch.is_some_and(|failed| command.epoch() <= failed) {
            continue;
        }
        let epoch = command.epoch();
        let outcome = match command {
            SinkCommand::HydrateBegin { schema, .. } => {
                sink.hydrate_begin(&schema).await.map(|()| None)
            }
            SinkCommand::HydrateRows { rows, .. } => sink.hydrate_rows(rows).await.map(|()| None),
            SinkCommand::HydrateEnd { cutoff_ts, .. } => sink
                .hydrate_end(cutoff_ts)
                .await
                .map(|()| Some(SinkReply::Hydrated { epoch })),
            SinkCommand::Apply { batch, .. } => {
                let (ops, ts) = (batch.ops.len(), batch.ts);
                sink.apply(&batch)
                    .await
                    .map(|()| Some(SinkReply::Applied { epoch, ts, ops }))
            }
        };
        match outcome {
            Ok(Some(reply)) => {
                let _ = tx.send(reply);
            }
            Ok(None) => {}
            Err(error) => {
                failed_epoch = Some(epoch);
                let _ = tx.send(SinkReply::Failed { epoch, error });
            }
        }
    }
    let name = sink.name();
    if let Err(error) = sink.close().await {
        warn!(sink = name, error = %error, "sink close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.max_pending_keys, Consolidator::DEFAULT_MAX_PENDING_KEYS);
        assert_eq!(config.hydration, HydrationMode::SubscribeSnapshot);
    }

    #[test]
    fn test_status_transitions() {
        let status = PipelineStatus::new("orders", "search");
        assert_eq!(status.state(), PipelineState::Initializing);
        assert!(!status.is_ready());

        status.set_state(PipelineState::Hydrating);
        assert_eq!(status.health(), HealthStatus::Unknown);

        status.mark_hydrated();
        status.set_state(PipelineState::Streaming);
        assert!(status.is_ready());
        assert!(status.health().is_healthy());

        status.set_error(&SyncError::StreamEnded);
        status.set_state(PipelineState::Reconnecting);
        assert!(status.health().is_operational());
        assert!(status.last_error().unwrap().contains("stream ended"));

        status.set_state(PipelineState::Fatal);
        assert!(!status.health().is_operational());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Streaming.to_string(), "Streaming");
        assert_eq!(PipelineState::Fatal.to_string(), "Fatal");
    }
}
