//! Document shaping for the search sink.
//!
//! A shape maps a view row onto an index document. The default
//! [`IdentityShape`] is column-to-field with two fixed rules:
//! timestamps become ISO-8601 UTC strings and `_`-prefixed columns are
//! dropped. A value that cannot be represented raises a fatal shape
//! error — columns are never silently lost.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use freshsync_core::error::SyncError;
use freshsync_core::value::Row;

/// Maps rows of one view onto index documents.
pub trait DocShape: Send + Sync {
    /// Registry identifier (matches the descriptor's `shape_id`).
    fn id(&self) -> &'static str;

    /// Index this shape writes to; defaults to the view name.
    fn index_name(&self, view: &str) -> String {
        view.to_string()
    }

    /// The index mapping installed when the index is created.
    fn mapping(&self) -> serde_json::Value;

    /// Shapes one row into a document body.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShapeError`] when a value has no document
    /// representation.
    fn shape(&self, row: &Row) -> Result<serde_json::Value, SyncError>;
}

/// Column-to-field identity shape with dynamic mapping.
#[derive(Debug, Default)]
pub struct IdentityShape;

impl DocShape for IdentityShape {
    fn id(&self) -> &'static str {
        "identity"
    }

    fn mapping(&self) -> serde_json::Value {
        json!({ "dynamic": true })
    }

    fn shape(&self, row: &Row) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::Value::Object(row.to_json_object(true)?))
    }
}

/// Shape for the denormalized orders search view: identity fields with
/// an explicit mapping tuned for the ops dashboard's fuzzy searches.
#[derive(Debug, Default)]
pub struct OrdersShape;

impl DocShape for OrdersShape {
    fn id(&self) -> &'static str {
        "orders"
    }

    fn index_name(&self, _view: &str) -> String {
        "orders".to_string()
    }

    fn mapping(&self) -> serde_json::Value {
        json!({
            "properties": {
                "order_id": { "type": "keyword" },
                "order_number": { "type": "text" },
                "order_status": { "type": "keyword" },
                "store_id": { "type": "keyword" },
                "customer_id": { "type": "keyword" },
                "customer_name": { "type": "text" },
                "customer_email": { "type": "keyword" },
                "customer_address": { "type": "text" },
                "store_name": { "type": "text" },
                "store_zone": { "type": "text" },
                "store_address": { "type": "text" },
                "assigned_courier_id": { "type": "keyword" },
                "delivery_task_status": { "type": "keyword" },
                "order_total_amount": { "type": "double" },
                "delivery_window_start": { "type": "date" },
                "delivery_window_end": { "type": "date" },
                "delivery_eta": { "type": "date" },
                "effective_updated_at": { "type": "date" }
            }
        })
    }

    fn shape(&self, row: &Row) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::Value::Object(row.to_json_object(true)?))
    }
}

/// Resolves a descriptor `shape_id` to its shape.
///
/// # Errors
///
/// Returns [`SyncError::InvalidDescriptor`] for an unknown id.
pub fn resolve_shape(shape_id: &str) -> Result<Arc<dyn DocShape>, SyncError> {
    let registry: HashMap<&str, Arc<dyn DocShape>> = HashMap::from([
        ("identity", Arc::new(IdentityShape) as Arc<dyn DocShape>),
        ("orders", Arc::new(OrdersShape) as Arc<dyn DocShape>),
    ]);
    registry.get(shape_id).map(Arc::clone).ok_or_else(|| {
        SyncError::InvalidDescriptor(format!("unknown shape '{shape_id}'"))
    })
}
