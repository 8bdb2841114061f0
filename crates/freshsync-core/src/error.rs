//! Error types for the synchronization core.
//!
//! [`SyncError`] is the unified error for every stage of a pipeline.
//! Variants fall into five families with different blast radii:
//!
//! - **Transient**: recovered by the supervisor's reconnect loop.
//! - **Protocol**: fatal for the affected pipeline only.
//! - **Config**: fatal for the whole process at startup.
//! - **Sink**: per-item rejections are absorbed locally; shape errors
//!   are fatal for the pipeline.
//! - **Client**: terminate one broadcast session only.

use thiserror::Error;

/// Errors that can occur anywhere in a sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Transient (supervisor reconnects) ──
    /// The upstream engine or a sink endpoint is unreachable.
    #[error("upstream unavailable: {0}")]
    NetworkUnavailable(String),

    /// The subscription stream ended; it is expected to be infinite.
    #[error("change stream ended")]
    StreamEnded,

    /// A sink bulk request did not complete within its deadline.
    #[error("sink request timed out after {0}ms")]
    SinkTimeout(u64),

    // ── Protocol (fatal per pipeline) ──
    /// The subscribed view does not exist upstream.
    #[error("view '{0}' does not exist upstream")]
    ViewNotFound(String),

    /// A change row carried a diff outside {-1, +1}.
    #[error("unexpected diff {diff} for key '{key}'")]
    UnexpectedDiff {
        /// Row key of the offending change.
        key: String,
        /// The diff value as received.
        diff: i64,
    },

    /// The configured key column is absent, null, or empty.
    #[error("key column '{0}' missing or empty")]
    MissingKeyColumn(String),

    /// A change or progress row carried no timestamp.
    #[error("row carries no timestamp")]
    MissingTimestamp,

    /// A timestamp regressed below the last flushed batch.
    #[error("timestamp {ts} regressed below flushed watermark {watermark}")]
    NonMonotonicTimestamp {
        /// The regressed timestamp.
        ts: u64,
        /// The watermark it fell below.
        watermark: u64,
    },

    /// The net diff for one key exceeded ±1 within a progress window.
    #[error("net diff for key '{0}' exceeded \u{b1}1 within one progress window")]
    NetDiffOverflow(String),

    /// A snapshot row appeared after hydration completed.
    #[error("snapshot row received outside the snapshot phase")]
    UnexpectedSnapshotRow,

    /// A cell value could not be parsed as its declared column type.
    #[error("column '{column}': cannot parse '{value}' as {ty}")]
    UnparseableColumn {
        /// Column name.
        column: String,
        /// Offending text value.
        value: String,
        /// Declared column type.
        ty: String,
    },

    /// A row's arity did not match the captured view schema.
    #[error("row has {got} columns, schema has {want}")]
    ColumnCountMismatch {
        /// Columns received.
        got: usize,
        /// Columns expected.
        want: usize,
    },

    /// Upstream rejected the configured credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    // ── Config (fatal process-wide) ──
    /// A pipeline descriptor line could not be parsed or validated.
    #[error("invalid pipeline descriptor: {0}")]
    InvalidDescriptor(String),

    /// An endpoint URL could not be parsed or resolved.
    #[error("unresolvable endpoint '{endpoint}': {reason}")]
    UnresolvableEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// Why it could not be used.
        reason: String,
    },

    /// A required configuration value is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    // ── Sink ──
    /// The sink rejected a single document; the stream continues and the
    /// next hydration repairs the drift.
    #[error("sink rejected document '{key}': {reason}")]
    PerItemRejected {
        /// Row key of the rejected document.
        key: String,
        /// Sink-reported reason.
        reason: String,
    },

    /// A payload value could not be shaped into a sink document.
    #[error("cannot shape column '{column}': {reason}")]
    ShapeError {
        /// Column name.
        column: String,
        /// Why shaping failed.
        reason: String,
    },

    // ── Client (terminate one session) ──
    /// A broadcast client sent a frame the server cannot interpret.
    #[error("bad client frame: {0}")]
    BadFrame(String),

    /// A broadcast client's outbound queue overflowed.
    #[error("client {0} cannot keep up")]
    SlowConsumer(u64),

    // ── Control flow ──
    /// The pipeline is shutting down; not a failure.
    #[error("pipeline is shutting down")]
    Cancelled,

    /// An error that does not fit the other categories.
    #[error("internal error: {0}")]
    Internal(String),

    /// An I/O error from the underlying system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Returns `true` if the supervisor should reconnect rather than halt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::StreamEnded
                | SyncError::SinkTimeout(_)
                | SyncError::Io(_)
        )
    }

    /// Returns `true` for configuration errors that abort startup.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidDescriptor(_)
                | SyncError::UnresolvableEndpoint { .. }
                | SyncError::MissingConfig(_)
        )
    }

    /// Returns `true` for upstream schema errors (exit code 2 territory).
    #[must_use]
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            SyncError::ViewNotFound(_) | SyncError::ColumnCountMismatch { .. }
        )
    }

    /// Short classification label used in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NetworkUnavailable(_) => "network_unavailable",
            SyncError::StreamEnded => "stream_ended",
            SyncError::SinkTimeout(_) => "sink_timeout",
            SyncError::ViewNotFound(_) => "view_not_found",
            SyncError::UnexpectedDiff { .. } => "unexpected_diff",
            SyncError::MissingKeyColumn(_) => "missing_key_column",
            SyncError::MissingTimestamp => "missing_timestamp",
            SyncError::NonMonotonicTimestamp { .. } => "non_monotonic_timestamp",
            SyncError::NetDiffOverflow(_) => "net_diff_overflow",
            SyncError::UnexpectedSnapshotRow => "unexpected_snapshot_row",
            SyncError::UnparseableColumn { .. } => "unparseable_column",
            SyncError::ColumnCountMismatch { .. } => "column_count_mismatch",
            SyncError::AuthenticationFailed(_) => "authentication_failed",
            SyncError::InvalidDescriptor(_) => "invalid_descriptor",
            SyncError::UnresolvableEndpoint { .. } => "unresolvable_endpoint",
            SyncError::MissingConfig(_) => "missing_config",
            SyncError::PerItemRejected { .. } => "per_item_rejected",
            SyncError::ShapeError { .. } => "shape_error",
            SyncError::BadFrame(_) => "bad_frame",
            SyncError::SlowConsumer(_) => "slow_consumer",
            SyncError::Cancelled => "cancelled",
            SyncError::Internal(_) => "internal",
            SyncError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::NetworkUnavailable("down".into()).is_transient());
        assert!(SyncError::StreamEnded.is_transient());
        assert!(SyncError::SinkTimeout(30_000).is_transient());
        assert!(!SyncError::ViewNotFound("orders".into()).is_transient());
        assert!(!SyncError::Cancelled.is_transient());
    }

    #[test]
    fn test_config_classification() {
        assert!(SyncError::MissingConfig("UPSTREAM_URL".into()).is_config());
        assert!(SyncError::InvalidDescriptor("bad line".into()).is_config());
        assert!(!SyncError::StreamEnded.is_config());
    }

    #[test]
    fn test_schema_classification() {
        assert!(SyncError::ViewNotFound("nonexistent".into()).is_schema());
        assert!(!SyncError::NetworkUnavailable("x".into()).is_schema());
    }

    #[test]
    fn test_display_contains_context() {
        let err = SyncError::UnexpectedDiff {
            key: "o1".into(),
            diff: 2,
        };
        assert!(err.to_string().contains("o1"));
        assert!(err.to_string().contains('2'));

        let err = SyncError::NonMonotonicTimestamp {
            ts: 3,
            watermark: 7,
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(SyncError::StreamEnded.kind(), "stream_ended");
        assert_eq!(
            SyncError::SlowConsumer(7).kind(),
            "slow_consumer"
        );
    }
}
