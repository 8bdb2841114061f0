//! Testing utilities: scripted upstreams and recording sinks for the
//! end-to-end pipeline suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::consolidate::{FlushBatch, NetOp};
use crate::error::SyncError;
use crate::event::RawRow;
use crate::sink::SinkAdapter;
use crate::source::{SubscribeOptions, UpstreamConnector};
use crate::value::{ColumnDef, ColumnType, Row, ViewSchema};

/// A two-column `orders`-like schema (`order_id`, `status`).
#[must_use]
pub fn orders_schema() -> Arc<ViewSchema> {
    Arc::new(ViewSchema::new(
        "orders",
        vec![
            ColumnDef::new("order_id", ColumnType::Text),
            ColumnDef::new("status", ColumnType::Text),
        ],
    ))
}

/// Cells for the [`orders_schema`].
#[must_use]
pub fn order_cells(key: &str, status: &str) -> Vec<Option<String>> {
    vec![Some(key.to_string()), Some(status.to_string())]
}

/// A parsed row for the [`orders_schema`].
///
/// # Panics
///
/// Panics when the cells do not parse (cannot happen for text columns).
#[must_use]
pub fn order_row(key: &str, status: &str) -> Row {
    Row::parse(&orders_schema(), &order_cells(key, status)).unwrap()
}

/// One result of a scripted `poll_rows` call.
#[derive(Debug)]
pub enum ScriptedPoll {
    /// Yield these rows.
    Rows(Vec<RawRow>),
    /// Fail with `NetworkUnavailable`, simulating a TCP reset.
    Disconnect,
    /// Fail with `StreamEnded`, simulating a clean cursor end.
    End,
}

/// One connect-to-disconnect session of a scripted upstream.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    /// Rows served by the standalone snapshot statement.
    pub snapshot: Vec<RawRow>,
    /// Scripted `poll_rows` results, in order.
    pub polls: VecDeque<ScriptedPoll>,
}

impl ScriptedSession {
    /// Creates a session from poll results only.
    #[must_use]
    pub fn from_polls(polls: Vec<ScriptedPoll>) -> Self {
        Self {
            snapshot: Vec::new(),
            polls: polls.into(),
        }
    }
}

struct ScriptedState {
    session: Option<ScriptedSession>,
    snapshot_served: bool,
}

/// An [`UpstreamConnector`] that replays scripted sessions.
///
/// Each `open()` consumes the next session; once the script runs dry,
/// `open()` fails with a transient error so the supervisor keeps backing
/// off until the test cancels it. An exhausted poll script yields empty
/// chunks (after a short pause) to keep the session alive.
pub struct ScriptedUpstream {
    view: String,
    schema: Arc<ViewSchema>,
    sessions: VecDeque<ScriptedSession>,
    state: ScriptedState,
}

impl ScriptedUpstream {
    /// Creates a scripted upstream over the given sessions.
    #[must_use]
    pub fn new(schema: Arc<ViewSchema>, sessions: Vec<ScriptedSession>) -> Self {
        Self {
            view: schema.view.clone(),
            schema,
            sessions: sessions.into(),
            state: ScriptedState {
                session: None,
                snapshot_served: false,
            },
        }
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedUpstream {
    fn view(&self) -> &str {
        &self.view
    }

    async fn open(&mut self) -> Result<Arc<ViewSchema>, SyncError> {
        match self.sessions.pop_front() {
            Some(session) => {
                self.state = ScriptedState {
                    session: Some(session),
                    snapshot_served: false,
                };
                Ok(Arc::clone(&self.schema))
            }
            None => Err(SyncError::NetworkUnavailable(
                "scripted upstream exhausted".to_string(),
            )),
        }
    }

    async fn begin_snapshot(&mut self) -> Result<(), SyncError> {
        self.state.snapshot_served = false;
        Ok(())
    }

    async fn poll_snapshot(
        &mut self,
        _max_rows: usize,
    ) -> Result<Option<Vec<RawRow>>, SyncError> {
        if self.state.snapshot_served {
            return Ok(None);
        }
        self.state.snapshot_served = true;
        let session = self
            .state
            .session
            .as_ref()
            .ok_or_else(|| SyncError::NetworkUnavailable("not open".to_string()))?;
        Ok(Some(session.snapshot.clone()))
    }

    async fn subscribe(&mut self, _options: SubscribeOptions) -> Result<(), SyncError> {
        if self.state.session.is_none() {
            return Err(SyncError::NetworkUnavailable("not open".to_string()));
        }
        Ok(())
    }

    async fn poll_rows(&mut self, _max_rows: usize) -> Result<Vec<RawRow>, SyncError> {
        let session = self
            .state
            .session
            .as_mut()
            .ok_or_else(|| SyncError::NetworkUnavailable("not open".to_string()))?;
        match session.polls.pop_front() {
            Some(ScriptedPoll::Rows(rows)) => Ok(rows),
            Some(ScriptedPoll::Disconnect) => Err(SyncError::NetworkUnavailable(
                "scripted disconnect".to_string(),
            )),
            Some(ScriptedPoll::End) => Err(SyncError::StreamEnded),
            None => {
                // Idle but alive, like a quiet FETCH timeout.
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.state.session = None;
        Ok(())
    }
}

/// Failure to inject into a [`RecordingSink`] apply.
#[derive(Debug, Clone, Copy)]
pub enum InjectedFailure {
    /// `SinkTimeout` — the supervisor reconnects.
    Transient,
    /// `ShapeError` — the pipeline halts.
    Fatal,
}

/// Everything a [`RecordingSink`] has seen.
#[derive(Debug, Default)]
pub struct SinkRecord {
    /// Current visible state.
    pub live: HashMap<String, Row>,
    /// In-progress hydration staging.
    pub staged: HashMap<String, Row>,
    /// `hydrate_begin` calls.
    pub hydrate_begins: u64,
    /// Completed hydrations.
    pub hydrations: u64,
    /// Cutoffs passed to `hydrate_end`, in order.
    pub cutoffs: Vec<u64>,
    /// Applied batches, in order.
    pub batches: Vec<FlushBatch>,
    /// Whether `close` ran.
    pub closed: bool,
}

/// An in-memory [`SinkAdapter`] that records everything applied to it.
pub struct RecordingSink {
    record: Arc<Mutex<SinkRecord>>,
    inject: Arc<Mutex<VecDeque<InjectedFailure>>>,
}

impl RecordingSink {
    /// Creates a sink and the shared record handle for assertions.
    #[must_use]
    pub fn new() -> (Self, Arc<Mutex<SinkRecord>>) {
        let record = Arc::new(Mutex::new(SinkRecord::default()));
        (
            Self {
                record: Arc::clone(&record),
                inject: Arc::new(Mutex::new(VecDeque::new())),
            },
            record,
        )
    }

    /// Queues a failure for an upcoming `apply` call.
    pub fn inject_failure(&self, failure: InjectedFailure) {
        self.inject.lock().push_back(failure);
    }
}

#[async_trait]
impl SinkAdapter for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn hydrate_begin(&mut self, _schema: &ViewSchema) -> Result<(), SyncError> {
        let mut record = self.record.lock();
        record.hydrate_begins += 1;
        record.staged.clear();
        Ok(())
    }

    async fn hydrate_rows(&mut self, rows: Vec<(String, Row)>) -> Result<(), SyncError> {
        let mut record = self.record.lock();
        for (key, row) in rows {
            record.staged.insert(key, row);
        }
        Ok(())
    }

    async fn hydrate_end(&mut self, cutoff_ts: u64) -> Result<(), SyncError> {
        let mut record = self.record.lock();
        record.live = std::mem::take(&mut record.staged);
        record.hydrations += 1;
        record.cutoffs.push(cutoff_ts);
        Ok(())
    }

    async fn apply(&mut self, batch: &FlushBatch) -> Result<(), SyncError> {
        if let Some(failure) = self.inject.lock().pop_front() {
            return Err(match failure {
                InjectedFailure::Transient => SyncError::SinkTimeout(30_000),
                InjectedFailure::Fatal => SyncError::ShapeError {
                    column: "injected".to_string(),
                    reason: "injected fatal failure".to_string(),
                },
            });
        }
        let mut record = self.record.lock();
        for op in &batch.ops {
            match op {
                NetOp::Upsert { key, row } => {
                    record.live.insert(key.clone(), row.clone());
                }
                NetOp::Delete { key } => {
                    record.live.remove(key);
                }
            }
        }
        record.batches.push(batch.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.record.lock().closed = true;
        Ok(())
    }
}
