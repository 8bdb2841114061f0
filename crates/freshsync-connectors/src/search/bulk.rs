//! Bulk NDJSON assembly and response parsing.
//!
//! The search endpoint accepts newline-delimited action/document pairs:
//!
//! ```text
//! {"index":{"_index":"orders","_id":"o1"}}
//! {"order_id":"o1","order_status":"NEW"}
//! {"delete":{"_index":"orders","_id":"o2"}}
//! ```
//!
//! Responses report per-item outcomes; transport-level failures are the
//! caller's concern.

use serde::Deserialize;
use serde_json::json;

use freshsync_core::consolidate::NetOp;
use freshsync_core::error::SyncError;

use super::shape::DocShape;

/// One assembled bulk action: metadata line plus optional document line.
#[derive(Debug, Clone)]
pub struct BulkAction {
    /// Row key, doubling as the document id.
    pub key: String,
    /// Action metadata line.
    pub meta: String,
    /// Document source line (`None` for deletes).
    pub doc: Option<String>,
}

impl BulkAction {
    /// Bytes this action contributes to an NDJSON body.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.meta.len() + 1 + self.doc.as_ref().map_or(0, |d| d.len() + 1)
    }
}

/// Shapes net operations into bulk actions for one index.
///
/// # Errors
///
/// Returns [`SyncError::ShapeError`] when a row cannot be shaped.
pub fn build_actions(
    index: &str,
    ops: &[NetOp],
    shape: &dyn DocShape,
) -> Result<Vec<BulkAction>, SyncError> {
    let mut actions = Vec::with_capacity(ops.len());
    for op in ops {
        let action = match op {
            NetOp::Upsert { key, row } => {
                let doc = shape.shape(row)?;
                BulkAction {
                    key: key.clone(),
                    meta: json!({"index": {"_index": index, "_id": key}}).to_string(),
                    doc: Some(doc.to_string()),
                }
            }
            NetOp::Delete { key } => BulkAction {
                key: key.clone(),
                meta: json!({"delete": {"_index": index, "_id": key}}).to_string(),
                doc: None,
            },
        };
        actions.push(action);
    }
    Ok(actions)
}

/// Splits actions into chunks bounded by document count and body bytes,
/// whichever bites first. A single oversized action still ships alone.
#[must_use]
pub fn chunk_actions(
    actions: Vec<BulkAction>,
    max_docs: usize,
    max_bytes: usize,
) -> Vec<Vec<BulkAction>> {
    let max_docs = max_docs.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<BulkAction> = Vec::new();
    let mut current_bytes = 0usize;
    for action in actions {
        let len = action.byte_len();
        if !current.is_empty() && (current.len() >= max_docs || current_bytes + len > max_bytes)
        {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += len;
        current.push(action);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Renders one chunk as an NDJSON request body.
#[must_use]
pub fn to_ndjson(chunk: &[BulkAction]) -> String {
    let mut body = String::new();
    for action in chunk {
        body.push_str(&action.meta);
        body.push('\n');
        if let Some(doc) = &action.doc {
            body.push_str(doc);
            body.push('\n');
        }
    }
    body
}

/// Bulk endpoint response.
#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    /// Whether any item failed.
    #[serde(default)]
    pub errors: bool,
    /// Per-item outcomes, in request order.
    #[serde(default)]
    pub items: Vec<BulkItem>,
}

/// One item of a bulk response, keyed by the action it answers.
#[derive(Debug, Deserialize)]
pub struct BulkItem {
    /// Outcome of an `index` action.
    #[serde(default)]
    pub index: Option<BulkItemOutcome>,
    /// Outcome of a `delete` action.
    #[serde(default)]
    pub delete: Option<BulkItemOutcome>,
}

/// Outcome of one bulk action.
#[derive(Debug, Deserialize)]
pub struct BulkItemOutcome {
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// HTTP-style status for this item.
    #[serde(default)]
    pub status: u16,
    /// Error detail when the item failed.
    #[serde(default)]
    pub error: Option<BulkItemError>,
}

/// Error detail of a failed bulk item.
#[derive(Debug, Deserialize)]
pub struct BulkItemError {
    /// Error class reported by the sink.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Extracts failed items as `(document id, reason)` pairs.
///
/// A 404 on delete is success here: the document was already gone, and
/// deletes must stay idempotent.
#[must_use]
pub fn failed_items(response: &BulkResponse) -> Vec<(String, String)> {
    let mut failed = Vec::new();
    for item in &response.items {
        let (outcome, is_delete) = match (&item.index, &item.delete) {
            (Some(outcome), _) => (outcome, false),
            (None, Some(outcome)) => (outcome, true),
            (None, None) => continue,
        };
        if outcome.status < 300 || (is_delete && outcome.status == 404) {
            continue;
        }
        let reason = outcome
            .error
            .as_ref()
            .map_or_else(
                || format!("status {}", outcome.status),
                |e| {
                    e.reason
                        .clone()
                        .unwrap_or_else(|| e.kind.clone())
                },
            );
        failed.push((outcome.id.clone(), reason));
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::shape::IdentityShape;
    use freshsync_core::value::{ColumnDef, ColumnType, Row, ViewSchema};
    use std::sync::Arc;

    fn ops() -> Vec<NetOp> {
        let schema = Arc::new(ViewSchema::new(
            "orders",
            vec![
                ColumnDef::new("order_id", ColumnType::Text),
                ColumnDef::new("status", ColumnType::Text),
            ],
        ));
        let row = Row::parse(&schema, &[Some("o1".to_string()), Some("NEW".to_string())])
            .unwrap();
        vec![
            NetOp::Upsert {
                key: "o1".to_string(),
                row,
            },
            NetOp::Delete {
                key: "o2".to_string(),
            },
        ]
    }

    #[test]
    fn test_build_actions() {
        let actions = build_actions("orders", &ops(), &IdentityShape).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].meta.contains("\"index\""));
        assert!(actions[0].meta.contains("\"_id\":\"o1\""));
        assert!(actions[0].doc.as_ref().unwrap().contains("NEW"));
        assert!(actions[1].meta.contains("\"delete\""));
        assert!(actions[1].doc.is_none());
    }

    #[test]
    fn test_ndjson_layout() {
        let actions = build_actions("orders", &ops(), &IdentityShape).unwrap();
        let body = to_ndjson(&actions);
        // index meta + doc + delete meta = 3 lines, trailing newline.
        assert_eq!(body.lines().count(), 3);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_chunk_by_docs() {
        let actions: Vec<BulkAction> = (0..5)
            .map(|i| BulkAction {
                key: format!("k{i}"),
                meta: "{}".to_string(),
                doc: None,
            })
            .collect();
        let chunks = chunk_actions(actions, 2, usize::MAX);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn test_chunk_by_bytes() {
        let actions: Vec<BulkAction> = (0..4)
            .map(|i| BulkAction {
                key: format!("k{i}"),
                meta: "m".repeat(50),
                doc: Some("d".repeat(49)),
            })
            .collect();
        // Each action is 101 bytes; a 150-byte bound forces one per chunk.
        let chunks = chunk_actions(actions, 100, 150);
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn test_oversized_action_ships_alone() {
        let actions = vec![BulkAction {
            key: "big".to_string(),
            meta: "m".repeat(10),
            doc: Some("d".repeat(1000)),
        }];
        let chunks = chunk_actions(actions, 10, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn test_failed_items_parsing() {
        let body = serde_json::json!({
            "errors": true,
            "items": [
                { "index": { "_id": "good", "status": 201 } },
                { "index": { "_id": "bad", "status": 400,
                             "error": { "type": "mapper_parsing_exception",
                                        "reason": "failed to parse field" } } },
                { "delete": { "_id": "gone", "status": 404 } },
                { "delete": { "_id": "locked", "status": 409 } }
            ]
        });
        let response: BulkResponse = serde_json::from_value(body).unwrap();
        let failed = failed_items(&response);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].0, "bad");
        assert!(failed[0].1.contains("failed to parse"));
        assert_eq!(failed[1].0, "locked");
    }
}
