//! WebSocket broadcast sink.
//!
//! Serves many browser clients per-view differential updates:
//! snapshot-then-deltas with a strict cutoff, bounded per-client
//! queues, and slow-consumer eviction. The [`BroadcastHub`] holds the
//! shared per-view state; one [`BroadcastSink`] per pipeline writes
//! into it; the [`WsServer`] serves clients out of it.

mod config;
mod hub;
mod protocol;
mod server;

pub use config::BroadcastConfig;
pub use hub::{BroadcastHub, BroadcastMetrics, ClientId, ViewChannel};
pub use protocol::{encode_frame, ClientFrame, DeltaUpsert, ServerFrame, SnapshotEntry};
pub use server::WsServer;

use std::sync::Arc;

use async_trait::async_trait;

use freshsync_core::consolidate::FlushBatch;
use freshsync_core::error::SyncError;
use freshsync_core::sink::SinkAdapter;
use freshsync_core::value::{Row, ViewSchema};

/// Sink adapter writing one view's batches into the broadcast hub.
///
/// Applying is pure in-memory work plus non-blocking enqueues, so the
/// pipeline never stalls on a slow client.
pub struct BroadcastSink {
    channel: Arc<ViewChannel>,
}

impl BroadcastSink {
    /// Creates a sink over a view channel (see
    /// [`BroadcastHub::register_view`]).
    #[must_use]
    pub fn new(channel: Arc<ViewChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl SinkAdapter for BroadcastSink {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn hydrate_begin(&mut self, _schema: &ViewSchema) -> Result<(), SyncError> {
        self.channel.hydrate_begin();
        Ok(())
    }

    async fn hydrate_rows(&mut self, rows: Vec<(String, Row)>) -> Result<(), SyncError> {
        self.channel.hydrate_rows(rows)
    }

    async fn hydrate_end(&mut self, cutoff_ts: u64) -> Result<(), SyncError> {
        self.channel.hydrate_end(cutoff_ts);
        Ok(())
    }

    async fn apply(&mut self, batch: &FlushBatch) -> Result<(), SyncError> {
        self.channel.apply(batch)
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        // The channel outlives the sink: clients keep their last state
        // through a pipeline restart, and the server owns eviction.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshsync_core::consolidate::NetOp;
    use freshsync_core::value::{ColumnDef, ColumnType};

    fn schema() -> Arc<ViewSchema> {
        Arc::new(ViewSchema::new(
            "orders",
            vec![
                ColumnDef::new("order_id", ColumnType::Text),
                ColumnDef::new("status", ColumnType::Text),
            ],
        ))
    }

    #[tokio::test]
    async fn test_sink_drives_channel() {
        let hub = BroadcastHub::new();
        let channel = hub.register_view("orders");
        let mut sink = BroadcastSink::new(Arc::clone(&channel));
        assert_eq!(sink.name(), "broadcast");

        let schema = schema();
        sink.hydrate_begin(&schema).await.unwrap();
        let row = Row::parse(&schema, &[Some("o1".to_string()), Some("NEW".to_string())])
            .unwrap();
        sink.hydrate_rows(vec![("o1".to_string(), row.clone())])
            .await
            .unwrap();
        sink.hydrate_end(3).await.unwrap();
        assert!(channel.is_hydrated());
        assert_eq!(channel.row_count(), 1);

        sink.apply(&FlushBatch {
            ts: 4,
            ops: vec![NetOp::Delete {
                key: "o1".to_string(),
            }],
        })
        .await
        .unwrap();
        assert_eq!(channel.row_count(), 0);
        sink.close().await.unwrap();
    }
}
