//! Search-index sink adapter.
//!
//! Translates consolidated batches into bulk NDJSON writes. Hydration
//! pushes chunks through a rolling window of in-flight requests; live
//! batches are written one bulk call at a time to preserve batch
//! ordering. Per-item rejections are retried once, then logged and
//! dropped — the authoritative state lives upstream, and the next
//! hydration repairs any drift.

mod bulk;
mod config;
mod shape;

pub use bulk::{
    build_actions, chunk_actions, failed_items, to_ndjson, BulkAction, BulkItem,
    BulkItemError, BulkItemOutcome, BulkResponse,
};
pub use config::SearchSinkConfig;
pub use shape::{resolve_shape, DocShape, IdentityShape, OrdersShape};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use freshsync_core::consolidate::{FlushBatch, NetOp};
use freshsync_core::error::SyncError;
use freshsync_core::sink::SinkAdapter;
use freshsync_core::value::{Row, ViewSchema};

/// Counters for one search sink.
#[derive(Debug, Default)]
pub struct SearchSinkMetrics {
    /// Bulk requests issued.
    pub bulk_requests: AtomicU64,
    /// Documents indexed.
    pub docs_indexed: AtomicU64,
    /// Documents deleted.
    pub docs_deleted: AtomicU64,
    /// Sub-batch retries after per-item failures.
    pub item_retries: AtomicU64,
    /// Documents dropped after the retry also failed.
    pub item_rejects: AtomicU64,
}

/// Shared bulk dispatcher; cloned into hydration window tasks.
#[derive(Clone)]
struct BulkDispatcher {
    client: reqwest::Client,
    bulk_url: String,
    item_retry_delay: std::time::Duration,
    request_timeout_ms: u64,
    metrics: Arc<SearchSinkMetrics>,
}

impl BulkDispatcher {
    fn map_transport(&self, error: &reqwest::Error) -> SyncError {
        if error.is_timeout() {
            SyncError::SinkTimeout(self.request_timeout_ms)
        } else {
            SyncError::NetworkUnavailable(error.to_string())
        }
    }

    async fn post_bulk(&self, body: String) -> Result<BulkResponse, SyncError> {
        self.metrics.bulk_requests.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.bulk_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::NetworkUnavailable(format!(
                "bulk endpoint returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::NetworkUnavailable(format!("malformed bulk response: {e}")))
    }

    /// Sends one chunk; per-item failures get one delayed retry, then
    /// are absorbed with a log line and a counter bump.
    async fn send_chunk(self, chunk: Vec<BulkAction>) -> Result<(), SyncError> {
        let indexed = chunk.iter().filter(|a| a.doc.is_some()).count() as u64;
        let deleted = chunk.len() as u64 - indexed;

        let response = self.post_bulk(to_ndjson(&chunk)).await?;
        let failed = failed_items(&response);
        self.metrics.docs_indexed.fetch_add(indexed, Ordering::Relaxed);
        self.metrics.docs_deleted.fetch_add(deleted, Ordering::Relaxed);
        if failed.is_empty() {
            return Ok(());
        }

        self.metrics
            .item_retries
            .fetch_add(failed.len() as u64, Ordering::Relaxed);
        let failed_keys: HashSet<&str> = failed.iter().map(|(id, _)| id.as_str()).collect();
        let retry: Vec<BulkAction> = chunk
            .iter()
            .filter(|a| failed_keys.contains(a.key.as_str()))
            .cloned()
            .collect();
        debug!(items = retry.len(), "retrying rejected bulk items");
        tokio::time::sleep(self.item_retry_delay).await;

        let response = self.post_bulk(to_ndjson(&retry)).await?;
        for (id, reason) in failed_items(&response) {
            // Dropped on purpose: the stream must not stall on one bad
            // document, and the next hydration re-attempts it.
            self.metrics.item_rejects.fetch_add(1, Ordering::Relaxed);
            let error = SyncError::PerItemRejected { key: id, reason };
            warn!(
                stage = "search_sink",
                kind = error.kind(),
                error = %error,
                "document rejected after retry; dropping"
            );
        }
        Ok(())
    }
}

/// Bulk search-index sink for one view.
pub struct SearchSink {
    config: SearchSinkConfig,
    index: String,
    shape: Arc<dyn DocShape>,
    dispatcher: BulkDispatcher,
    inflight: FuturesUnordered<tokio::task::JoinHandle<Result<(), SyncError>>>,
    metrics: Arc<SearchSinkMetrics>,
}

impl SearchSink {
    /// Creates a sink for `view`, writing to the index chosen by the
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnresolvableEndpoint`] when the HTTP client
    /// cannot be built.
    pub fn new(
        config: SearchSinkConfig,
        view: &str,
        shape: Arc<dyn DocShape>,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::UnresolvableEndpoint {
                endpoint: config.base_url.clone(),
                reason: e.to_string(),
            })?;
        let index = shape.index_name(view);
        let metrics = Arc::new(SearchSinkMetrics::default());
        let dispatcher = BulkDispatcher {
            client,
            bulk_url: format!("{}/_bulk", config.base_url),
            item_retry_delay: config.item_retry_delay,
            request_timeout_ms: u64::try_from(config.request_timeout.as_millis())
                .unwrap_or(u64::MAX),
            metrics: Arc::clone(&metrics),
        };
        Ok(Self {
            config,
            index,
            shape,
            dispatcher,
            inflight: FuturesUnordered::new(),
            metrics,
        })
    }

    /// The index this sink writes to.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Handle to the sink's counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<SearchSinkMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn ensure_index(&self) -> Result<(), SyncError> {
        let url = format!("{}/{}", self.config.base_url, self.index);
        let head = self
            .dispatcher
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| self.dispatcher.map_transport(&e))?;
        if head.status().is_success() {
            return Ok(());
        }
        if head.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NetworkUnavailable(format!(
                "index probe returned {}",
                head.status()
            )));
        }

        let body = serde_json::json!({ "mappings": self.shape.mapping() });
        let created = self
            .dispatcher
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.dispatcher.map_transport(&e))?;
        let status = created.status();
        if status.is_success() {
            info!(index = %self.index, "created search index");
            return Ok(());
        }
        // Lost a create race with another worker: the index exists now.
        let text = created.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST
            && text.contains("resource_already_exists_exception")
        {
            return Ok(());
        }
        Err(SyncError::NetworkUnavailable(format!(
            "index create returned {status}: {text}"
        )))
    }

    async fn await_one_inflight(&mut self) -> Result<(), SyncError> {
        match self.inflight.next().await {
            None => Ok(()),
            Some(Ok(result)) => result,
            Some(Err(join_error)) => Err(SyncError::NetworkUnavailable(format!(
                "bulk task failed: {join_error}"
            ))),
        }
    }

    async fn drain_inflight(&mut self) -> Result<(), SyncError> {
        let mut first_error = None;
        while !self.inflight.is_empty() {
            if let Err(e) = self.await_one_inflight().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl SinkAdapter for SearchSink {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn hydrate_begin(&mut self, _schema: &ViewSchema) -> Result<(), SyncError> {
        self.drain_inflight().await?;
        self.ensure_index().await
    }

    async fn hydrate_rows(&mut self, rows: Vec<(String, Row)>) -> Result<(), SyncError> {
        let ops: Vec<NetOp> = rows
            .into_iter()
            .map(|(key, row)| NetOp::Upsert { key, row })
            .collect();
        let actions = build_actions(&self.index, &ops, self.shape.as_ref())?;
        for chunk in chunk_actions(actions, self.config.bulk_max_docs, self.config.bulk_max_bytes)
        {
            while self.inflight.len() >= self.config.hydrate_window {
                self.await_one_inflight().await?;
            }
            let dispatcher = self.dispatcher.clone();
            self.inflight
                .push(tokio::spawn(dispatcher.send_chunk(chunk)));
        }
        Ok(())
    }

    async fn hydrate_end(&mut self, _cutoff_ts: u64) -> Result<(), SyncError> {
        self.drain_inflight().await
    }

    async fn apply(&mut self, batch: &FlushBatch) -> Result<(), SyncError> {
        let actions = build_actions(&self.index, &batch.ops, self.shape.as_ref())?;
        // One bulk call per batch when the bounds allow; chunks stay in
        // order either way.
        for chunk in chunk_actions(actions, self.config.bulk_max_docs, self.config.bulk_max_bytes)
        {
            self.dispatcher.clone().send_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.drain_inflight().await
    }
}
