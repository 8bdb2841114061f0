//! Health probe endpoints.
//!
//! `GET /ready` — every pipeline has completed at least one hydration.
//! `GET /live` — no pipeline has halted (`Fatal`) or stopped.
//!
//! Both report per-pipeline detail so one failed pipeline (which keeps
//! the aggregate at 503) is still visibly separate from the healthy
//! rest.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use freshsync_core::error::SyncError;
use freshsync_core::pipeline::{PipelineState, PipelineStatus};

type Statuses = Arc<Vec<Arc<PipelineStatus>>>;

fn pipeline_detail(status: &PipelineStatus) -> Value {
    let metrics = status.metrics.snapshot();
    json!({
        "view": status.view(),
        "sink": status.sink(),
        "state": status.state().to_string(),
        "ready": status.is_ready(),
        "health": status.health().to_string(),
        "last_error": status.last_error(),
        "batches_applied": metrics.batches_applied,
        "snapshot_rows": metrics.snapshot_rows,
        "reconnects": metrics.reconnects,
        "last_applied_ts": metrics.last_applied_ts,
    })
}

/// Computes the readiness verdict and report body.
#[must_use]
pub fn readiness(statuses: &[Arc<PipelineStatus>]) -> (bool, Value) {
    let ready = statuses.iter().all(|s| s.is_ready());
    let body = json!({
        "ready": ready,
        "pipelines": statuses.iter().map(|s| pipeline_detail(s)).collect::<Vec<_>>(),
    });
    (ready, body)
}

/// Computes the liveness verdict and report body. A pipeline mid-
/// hydration counts as live — every reconnect passes through
/// `Hydrating`, and flapping the probe on each reconnect would turn
/// transient upstream blips into restarts.
#[must_use]
pub fn liveness(statuses: &[Arc<PipelineStatus>]) -> (bool, Value) {
    let live = statuses.iter().all(|s| {
        !matches!(
            s.state(),
            PipelineState::Fatal | PipelineState::Stopped
        )
    });
    let body = json!({
        "live": live,
        "pipelines": statuses.iter().map(|s| pipeline_detail(s)).collect::<Vec<_>>(),
    });
    (live, body)
}

async fn ready_handler(State(statuses): State<Statuses>) -> (StatusCode, Json<Value>) {
    let (ready, body) = readiness(&statuses);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn live_handler(State(statuses): State<Statuses>) -> (StatusCode, Json<Value>) {
    let (live, body) = liveness(&statuses);
    let code = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Binds the probe server and serves it in a background task.
///
/// # Errors
///
/// Returns [`SyncError::UnresolvableEndpoint`] when the address cannot
/// be bound.
pub async fn serve(
    addr: &str,
    statuses: Statuses,
) -> Result<tokio::task::JoinHandle<()>, SyncError> {
    let router = Router::new()
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(statuses);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        SyncError::UnresolvableEndpoint {
            endpoint: addr.to_string(),
            reason: e.to_string(),
        }
    })?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "probe endpoints listening");
    Ok(tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_requires_every_pipeline() {
        let a = Arc::new(PipelineStatus::new("orders_search_source", "search"));
        let b = Arc::new(PipelineStatus::new("orders_search_source", "broadcast"));
        let statuses = vec![Arc::clone(&a), Arc::clone(&b)];

        let (ready, _) = readiness(&statuses);
        assert!(!ready);

        a.mark_hydrated();
        let (ready, body) = readiness(&statuses);
        assert!(!ready);
        assert_eq!(body["pipelines"][0]["ready"], true);
        assert_eq!(body["pipelines"][1]["ready"], false);

        b.mark_hydrated();
        let (ready, _) = readiness(&statuses);
        assert!(ready);
    }

    #[test]
    fn test_one_fatal_pipeline_degrades_but_isolates() {
        // A misconfigured view halts its own pipeline; the other one
        // still hydrates and reports ready on its own line.
        let bad = Arc::new(PipelineStatus::new("nonexistent", "search"));
        let good = Arc::new(PipelineStatus::new("orders_search_source", "search"));
        bad.set_error(&SyncError::ViewNotFound("nonexistent".to_string()));
        bad.set_state(PipelineState::Fatal);
        good.mark_hydrated();
        good.set_state(PipelineState::Streaming);
        let statuses = vec![Arc::clone(&bad), Arc::clone(&good)];

        let (ready, body) = readiness(&statuses);
        assert!(!ready);
        assert_eq!(body["pipelines"][0]["ready"], false);
        assert!(body["pipelines"][0]["last_error"]
            .as_str()
            .unwrap()
            .contains("nonexistent"));
        assert_eq!(body["pipelines"][1]["ready"], true);

        let (live, _) = liveness(&statuses);
        assert!(!live);
    }

    #[test]
    fn test_liveness_tracks_states() {
        let a = Arc::new(PipelineStatus::new("orders_search_source", "search"));
        let statuses = vec![Arc::clone(&a)];
        let (live, body) = liveness(&statuses);
        assert!(live);
        assert_eq!(body["pipelines"][0]["state"], "Initializing");

        a.set_state(PipelineState::Reconnecting);
        assert!(liveness(&statuses).0);

        a.set_state(PipelineState::Fatal);
        assert!(!liveness(&statuses).0);
    }
}
