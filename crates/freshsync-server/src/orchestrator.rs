//! Pipeline orchestration.
//!
//! Spawns one supervised pipeline per descriptor, shares a single
//! broadcast hub between broadcast pipelines, and owns graceful
//! shutdown: cancel pipelines first (sinks drain behind their command
//! channels), then close the WebSocket endpoint, then let connectors
//! drop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use freshsync_connectors::broadcast::{BroadcastHub, BroadcastSink, WsServer};
use freshsync_connectors::search::{resolve_shape, SearchSink};
use freshsync_connectors::upstream::MaterializeConnector;
use freshsync_core::descriptor::SinkKind;
use freshsync_core::error::SyncError;
use freshsync_core::pipeline::{Pipeline, PipelineStatus};
use freshsync_core::sink::SinkAdapter;

use crate::config::ServerConfig;

/// Running pipelines plus the shared broadcast endpoint.
pub struct Orchestrator {
    statuses: Arc<Vec<Arc<PipelineStatus>>>,
    handles: Vec<tokio::task::JoinHandle<Result<(), SyncError>>>,
    shutdown_tx: watch::Sender<bool>,
    ws_server: Option<WsServer>,
}

impl Orchestrator {
    /// Builds the sinks and spawns every pipeline.
    ///
    /// # Errors
    ///
    /// Returns a config-class error when a sink cannot be constructed
    /// or the broadcast endpoint cannot bind; no pipelines are left
    /// running on failure.
    pub async fn start(config: ServerConfig) -> Result<Self, SyncError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(BroadcastHub::new());
        let ws_server = if config.needs_broadcast() {
            // Register the channels before the endpoint accepts anyone,
            // so `hello` validation knows every legal view.
            for descriptor in &config.descriptors {
                if descriptor.sink == SinkKind::Broadcast {
                    hub.register_view(&descriptor.view);
                }
            }
            Some(WsServer::bind(Arc::clone(&hub), config.broadcast.clone()).await?)
        } else {
            None
        };

        // Build every sink before spawning anything, so a construction
        // failure leaves no pipeline running behind the error.
        let mut prepared = Vec::with_capacity(config.descriptors.len());
        for descriptor in &config.descriptors {
            let sink: Box<dyn SinkAdapter> = match descriptor.sink {
                SinkKind::Search => {
                    let search_config = config
                        .search
                        .clone()
                        .ok_or_else(|| SyncError::MissingConfig("SINK_SEARCH_URL".to_string()))?;
                    let shape = resolve_shape(&descriptor.shape_id)?;
                    Box::new(SearchSink::new(search_config, &descriptor.view, shape)?)
                }
                SinkKind::Broadcast => {
                    Box::new(BroadcastSink::new(hub.register_view(&descriptor.view)))
                }
            };
            prepared.push((descriptor, sink));
        }

        let mut statuses = Vec::with_capacity(prepared.len());
        let mut handles = Vec::with_capacity(prepared.len());
        for (descriptor, sink) in prepared {
            let status = Arc::new(PipelineStatus::new(
                &descriptor.view,
                descriptor.sink.to_string(),
            ));
            let connector = MaterializeConnector::new(config.upstream.clone(), &descriptor.view);
            let pipeline = Pipeline::new(
                connector,
                &descriptor.key_column,
                config.pipeline.clone(),
                Arc::clone(&status),
                shutdown_rx.clone(),
            );
            info!(pipeline = %descriptor.id(), "spawning pipeline");
            handles.push(tokio::spawn(pipeline.run(sink)));
            statuses.push(status);
        }

        Ok(Self {
            statuses: Arc::new(statuses),
            handles,
            shutdown_tx,
            ws_server,
        })
    }

    /// Shared status handles for the probe endpoints.
    #[must_use]
    pub fn statuses(&self) -> Arc<Vec<Arc<PipelineStatus>>> {
        Arc::clone(&self.statuses)
    }

    /// Runs until a shutdown signal or until every pipeline has ended
    /// on its own; returns the process exit code.
    pub async fn run(mut self) -> i32 {
        let handles = std::mem::take(&mut self.handles);
        let mut joined = futures_util::future::join_all(handles);

        let exit_code = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "signal listener failed; shutting down");
                }
                info!("shutdown requested");
                let _ = self.shutdown_tx.send(true);
                let _ = joined.await;
                0
            }
            results = &mut joined => {
                // Every supervisor halted without being asked to.
                let mut fatal = 0usize;
                let mut schema = false;
                for result in results {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            fatal += 1;
                            schema |= e.is_schema();
                            error!(kind = e.kind(), error = %e, "pipeline halted");
                        }
                        Err(join_error) => {
                            fatal += 1;
                            error!(error = %join_error, "pipeline task failed");
                        }
                    }
                }
                if fatal == 0 {
                    0
                } else if schema {
                    2
                } else {
                    1
                }
            }
        };

        if let Some(server) = self.ws_server.take() {
            server.shutdown().await;
        }
        info!(exit_code, "orchestrator stopped");
        exit_code
    }
}
