//! Materialize upstream connector.
//!
//! Speaks the standard relational wire protocol via `tokio-postgres`.
//! Schema discovery, snapshots, and the differential subscription all
//! run over the text protocol with cursor-based fetching:
//!
//! ```text
//! SET CLUSTER = <serving>
//! SHOW COLUMNS FROM <view>                           -- schema capture
//! DECLARE c CURSOR FOR SELECT * FROM <view>          -- snapshot
//! DECLARE c CURSOR FOR SUBSCRIBE (SELECT * FROM <view>)
//!     WITH (PROGRESS = true, SNAPSHOT = true)        -- subscription
//! FETCH <n> c [WITH (timeout = '...')]
//! ```
//!
//! Subscription rows carry the `mz_timestamp`, `mz_progressed`,
//! `mz_diff` prefix columns ahead of the view's own columns.

mod config;

pub use config::UpstreamConfig;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::SimpleQueryMessage;
use tracing::{debug, info, warn};

use freshsync_core::error::SyncError;
use freshsync_core::event::RawRow;
use freshsync_core::source::{SubscribeOptions, UpstreamConnector};
use freshsync_core::value::{ColumnDef, ColumnType, ViewSchema};

const SNAPSHOT_CURSOR: &str = "freshsync_snap";
const SUBSCRIBE_CURSOR: &str = "freshsync_sub";

/// Splits a raw subscription row into the stream prefix and payload.
///
/// With progress enabled the prefix is
/// `(mz_timestamp, mz_progressed, mz_diff)`, otherwise
/// `(mz_timestamp, mz_diff)`.
///
/// # Errors
///
/// Returns a protocol error when the prefix is truncated or its cells
/// do not parse.
pub fn parse_stream_cells(
    cells: Vec<Option<String>>,
    with_progress: bool,
) -> Result<RawRow, SyncError> {
    let prefix = if with_progress { 3 } else { 2 };
    if cells.len() < prefix {
        return Err(SyncError::ColumnCountMismatch {
            got: cells.len(),
            want: prefix,
        });
    }

    let parse_ts = |cell: &Option<String>| -> Result<u64, SyncError> {
        let text = cell.as_deref().ok_or(SyncError::MissingTimestamp)?;
        text.parse().map_err(|_| SyncError::UnparseableColumn {
            column: "mz_timestamp".to_string(),
            value: text.to_string(),
            ty: "int".to_string(),
        })
    };

    let ts = parse_ts(&cells[0])?;
    let progressed = with_progress && cells[1].as_deref() == Some("t");
    if progressed {
        return Ok(RawRow::progress(ts));
    }

    let diff_index = if with_progress { 2 } else { 1 };
    let diff = match cells[diff_index].as_deref() {
        None => None,
        Some(text) => Some(text.parse::<i64>().map_err(|_| {
            SyncError::UnparseableColumn {
                column: "mz_diff".to_string(),
                value: text.to_string(),
                ty: "int".to_string(),
            }
        })?),
    };

    let payload: Vec<Option<String>> = cells.into_iter().skip(prefix).collect();
    Ok(RawRow {
        ts: Some(ts),
        diff,
        progress: false,
        cells: payload,
    })
}

/// Maps a driver error onto the sync error taxonomy.
fn map_pg_error(error: &tokio_postgres::Error, view: &str) -> SyncError {
    match error.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE => {
            SyncError::ViewNotFound(view.to_string())
        }
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            SyncError::AuthenticationFailed(error.to_string())
        }
        Some(code) if *code == SqlState::INVALID_CURSOR_NAME => SyncError::StreamEnded,
        _ if error.to_string().contains("unknown catalog item") => {
            SyncError::ViewNotFound(view.to_string())
        }
        _ => SyncError::NetworkUnavailable(error.to_string()),
    }
}

/// Upstream connector for one Materialize view.
pub struct MaterializeConnector {
    view: String,
    config: UpstreamConfig,
    client: Option<tokio_postgres::Client>,
    driver: Option<tokio::task::JoinHandle<()>>,
    with_progress: bool,
    in_transaction: bool,
}

impl MaterializeConnector {
    /// Creates a connector bound to one view.
    #[must_use]
    pub fn new(config: UpstreamConfig, view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            config,
            client: None,
            driver: None,
            with_progress: true,
            in_transaction: false,
        }
    }

    fn client(&self) -> Result<&tokio_postgres::Client, SyncError> {
        self.client
            .as_ref()
            .ok_or_else(|| SyncError::NetworkUnavailable("connector not open".to_string()))
    }

    async fn simple_query(
        &self,
        sql: &str,
    ) -> Result<Vec<SimpleQueryMessage>, SyncError> {
        let client = self.client()?;
        client
            .simple_query(sql)
            .await
            .map_err(|e| map_pg_error(&e, &self.view))
    }

    /// Rolls back any open cursor transaction, tolerating failure.
    async fn end_transaction(&mut self) {
        if self.in_transaction {
            if let Ok(client) = self.client() {
                let _ = client.simple_query("ROLLBACK").await;
            }
            self.in_transaction = false;
        }
    }

    async fn discover_schema(&self) -> Result<Arc<ViewSchema>, SyncError> {
        let messages = self
            .simple_query(&format!("SHOW COLUMNS FROM {}", self.view))
            .await?;

        let mut columns = Vec::new();
        for message in &messages {
            if let SimpleQueryMessage::Row(row) = message {
                // Output columns: name, nullable, type [, comment].
                let (mut name_idx, mut type_idx) = (0, 2);
                for (i, col) in row.columns().iter().enumerate() {
                    match col.name() {
                        "name" => name_idx = i,
                        "type" => type_idx = i,
                        _ => {}
                    }
                }
                let name = row.get(name_idx).unwrap_or_default().to_string();
                let ty = ColumnType::from_upstream(row.get(type_idx).unwrap_or_default());
                columns.push(ColumnDef::new(name, ty));
            }
        }
        if columns.is_empty() {
            return Err(SyncError::ViewNotFound(self.view.clone()));
        }
        Ok(Arc::new(ViewSchema::new(self.view.clone(), columns)))
    }

    fn rows_from_messages(messages: Vec<SimpleQueryMessage>) -> Vec<Vec<Option<String>>> {
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                rows.push(
                    (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect(),
                );
            }
        }
        rows
    }
}

#[async_trait]
impl UpstreamConnector for MaterializeConnector {
    fn view(&self) -> &str {
        &self.view
    }

    async fn open(&mut self) -> Result<Arc<ViewSchema>, SyncError> {
        let _ = self.close().await;

        let pg = self.config.pg_config()?;
        let connect = pg.connect(tokio_postgres::NoTls);
        let (client, connection) =
            match tokio::time::timeout(self.config.connect_timeout, connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(map_pg_error(&e, &self.view)),
                Err(_) => {
                    return Err(SyncError::NetworkUnavailable(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    )))
                }
            };

        // Drive the connection from its own task; dropping the handle
        // would sever the session.
        let view = self.view.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(view = %view, error = %e, "upstream connection terminated");
            }
        });
        self.client = Some(client);
        self.driver = Some(driver);
        self.in_transaction = false;

        // Route queries to the serving cluster before anything else.
        self.simple_query(&format!("SET CLUSTER = {}", self.config.cluster))
            .await?;

        let schema = self.discover_schema().await?;
        info!(
            view = %self.view,
            columns = schema.len(),
            cluster = %self.config.cluster,
            "upstream connector open"
        );
        Ok(schema)
    }

    async fn begin_snapshot(&mut self) -> Result<(), SyncError> {
        self.end_transaction().await;
        self.simple_query("BEGIN").await?;
        self.in_transaction = true;
        self.simple_query(&format!(
            "DECLARE {SNAPSHOT_CURSOR} CURSOR FOR SELECT * FROM {}",
            self.view
        ))
        .await?;
        debug!(view = %self.view, "snapshot cursor open");
        Ok(())
    }

    async fn poll_snapshot(
        &mut self,
        max_rows: usize,
    ) -> Result<Option<Vec<RawRow>>, SyncError> {
        let messages = self
            .simple_query(&format!("FETCH {max_rows} {SNAPSHOT_CURSOR}"))
            .await?;
        let rows = Self::rows_from_messages(messages);
        if rows.is_empty() {
            self.end_transaction().await;
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(RawRow::snapshot).collect()))
    }

    async fn subscribe(&mut self, options: SubscribeOptions) -> Result<(), SyncError> {
        self.end_transaction().await;
        self.with_progress = options.with_progress;
        self.simple_query("BEGIN").await?;
        self.in_transaction = true;
        self.simple_query(&format!(
            "DECLARE {SUBSCRIBE_CURSOR} CURSOR FOR SUBSCRIBE (SELECT * FROM {}) \
             WITH (PROGRESS = {}, SNAPSHOT = {})",
            self.view, options.with_progress, options.emit_snapshot
        ))
        .await?;
        info!(
            view = %self.view,
            progress = options.with_progress,
            snapshot = options.emit_snapshot,
            "subscribed"
        );
        Ok(())
    }

    async fn poll_rows(&mut self, max_rows: usize) -> Result<Vec<RawRow>, SyncError> {
        let wait_ms = self.config.fetch_wait.as_millis();
        let messages = self
            .simple_query(&format!(
                "FETCH {max_rows} {SUBSCRIBE_CURSOR} WITH (timeout = '{wait_ms}ms')"
            ))
            .await?;
        Self::rows_from_messages(messages)
            .into_iter()
            .map(|cells| parse_stream_cells(cells, self.with_progress))
            .collect()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.end_transaction().await;
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        Ok(())
    }
}
