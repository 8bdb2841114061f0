//! Broadcast wire protocol.
//!
//! All frames are JSON objects discriminated by a `kind` field. A
//! client opens with `hello`, receives one (possibly chunked) snapshot
//! per subscribed view, then per-view deltas with non-decreasing
//! timestamps. The server pings idle clients; a missing `pong`
//! disconnects them.

use serde::{Deserialize, Serialize};
use tungstenite::Utf8Bytes;

use freshsync_core::error::SyncError;

/// Frames the client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a set of views.
    Hello {
        /// Views to subscribe to; must be non-empty and known.
        views: Vec<String>,
    },
    /// Liveness reply to a server `ping`.
    Pong,
}

/// One row of a snapshot frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Row key.
    pub key: String,
    /// Row payload.
    pub row: serde_json::Value,
}

/// One upsert of a delta frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaUpsert {
    /// Row key.
    pub key: String,
    /// Latest row payload.
    pub row: serde_json::Value,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A chunk of the subscription-time state of one view.
    Snapshot {
        /// View name.
        view: String,
        /// Rows in this chunk.
        rows: Vec<SnapshotEntry>,
    },
    /// Marks the end of a view's snapshot.
    SnapshotEnd {
        /// View name.
        view: String,
    },
    /// One consolidated batch applied to a view.
    Delta {
        /// View name.
        view: String,
        /// Upserted rows.
        upserts: Vec<DeltaUpsert>,
        /// Deleted keys.
        deletes: Vec<String>,
        /// Batch timestamp.
        ts: u64,
    },
    /// Liveness probe; the client answers with `pong`.
    Ping,
    /// Final frame before a controlled close.
    Bye {
        /// Why the session ends.
        reason: String,
    },
}

/// Serializes a server frame to a text payload.
///
/// # Errors
///
/// Returns [`SyncError::Internal`] if serialization fails (it cannot
/// for these types, but the error is not worth panicking over).
pub fn encode_frame(frame: &ServerFrame) -> Result<Utf8Bytes, SyncError> {
    serde_json::to_string(frame)
        .map(Utf8Bytes::from)
        .map_err(|e| SyncError::Internal(format!("frame encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_round_trip() {
        let text = r#"{"kind":"hello","views":["orders_search_source"]}"#;
        let frame: ClientFrame = serde_json::from_str(text).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Hello {
                views: vec!["orders_search_source".to_string()]
            }
        );
    }

    #[test]
    fn test_pong_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"kind":"pong"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Pong);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"kind":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r"not json").is_err());
    }

    #[test]
    fn test_delta_encoding() {
        let frame = ServerFrame::Delta {
            view: "orders".to_string(),
            upserts: vec![DeltaUpsert {
                key: "o1".to_string(),
                row: json!({"status": "PAID"}),
            }],
            deletes: vec!["o2".to_string()],
            ts: 42,
        };
        let encoded = encode_frame(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_str(encoded.as_str()).unwrap();
        assert_eq!(value["kind"], "delta");
        assert_eq!(value["view"], "orders");
        assert_eq!(value["upserts"][0]["key"], "o1");
        assert_eq!(value["deletes"][0], "o2");
        assert_eq!(value["ts"], 42);
    }

    #[test]
    fn test_snapshot_end_kind() {
        let encoded =
            encode_frame(&ServerFrame::SnapshotEnd { view: "v".to_string() }).unwrap();
        assert!(encoded.as_str().contains(r#""kind":"snapshot_end""#));
    }

    #[test]
    fn test_bye_encoding() {
        let encoded = encode_frame(&ServerFrame::Bye {
            reason: "slow_consumer".to_string(),
        })
        .unwrap();
        assert!(encoded.as_str().contains("slow_consumer"));
    }
}
