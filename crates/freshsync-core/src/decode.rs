//! Change stream decoding.
//!
//! [`RowDecoder`] is the pure classification stage between the upstream
//! connector's [`RawRow`]s and the consolidator's [`SourceEvent`]s:
//!
//! - progress flag set → [`SourceEvent::Progress`]
//! - no diff, not progress → [`SourceEvent::Snapshot`]
//! - diff ∈ {−1, +1} → [`SourceEvent::Change`]
//! - any other diff → fatal protocol error

use std::sync::Arc;

use crate::error::SyncError;
use crate::event::{Diff, RawRow, SourceEvent};
use crate::value::{Row, ViewSchema};

/// Per-view decoder, parameterized by the view schema and key column.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    schema: Arc<ViewSchema>,
    key_column: String,
    key_index: usize,
}

impl RowDecoder {
    /// Creates a decoder for a view.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingKeyColumn`] when the key column is not
    /// part of the schema.
    pub fn new(schema: Arc<ViewSchema>, key_column: &str) -> Result<Self, SyncError> {
        let key_index = schema
            .index_of(key_column)
            .ok_or_else(|| SyncError::MissingKeyColumn(key_column.to_string()))?;
        Ok(Self {
            schema,
            key_column: key_column.to_string(),
            key_index,
        })
    }

    /// The schema this decoder parses against.
    #[must_use]
    pub fn schema(&self) -> &Arc<ViewSchema> {
        &self.schema
    }

    /// Decodes one raw row into a stream event.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for diffs outside {−1, +1}, missing
    /// timestamps on change/progress rows, unparseable cells, or a
    /// missing/empty key value.
    pub fn decode(&self, raw: RawRow) -> Result<SourceEvent, SyncError> {
        if raw.progress {
            let ts = raw.ts.ok_or(SyncError::MissingTimestamp)?;
            return Ok(SourceEvent::Progress { ts });
        }

        let row = Row::parse(&self.schema, &raw.cells)?;
        let key = self.extract_key(&row)?;

        match raw.diff {
            None => Ok(SourceEvent::Snapshot { key, row }),
            Some(1) => Ok(SourceEvent::Change {
                ts: raw.ts.ok_or(SyncError::MissingTimestamp)?,
                diff: Diff::Insert,
                key,
                row,
            }),
            Some(-1) => Ok(SourceEvent::Change {
                ts: raw.ts.ok_or(SyncError::MissingTimestamp)?,
                diff: Diff::Retract,
                key,
                row,
            }),
            Some(diff) => Err(SyncError::UnexpectedDiff { key, diff }),
        }
    }

    fn extract_key(&self, row: &Row) -> Result<String, SyncError> {
        row.value_at(self.key_index)
            .and_then(crate::value::Value::as_key)
            .ok_or_else(|| SyncError::MissingKeyColumn(self.key_column.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ColumnDef, ColumnType};

    fn schema() -> Arc<ViewSchema> {
        Arc::new(ViewSchema::new(
            "orders",
            vec![
                ColumnDef::new("order_id", ColumnType::Text),
                ColumnDef::new("status", ColumnType::Text),
            ],
        ))
    }

    fn decoder() -> RowDecoder {
        RowDecoder::new(schema(), "order_id").unwrap()
    }

    fn cells(key: &str, status: &str) -> Vec<Option<String>> {
        vec![Some(key.to_string()), Some(status.to_string())]
    }

    #[test]
    fn test_unknown_key_column_rejected() {
        let err = RowDecoder::new(schema(), "no_such_column").unwrap_err();
        assert!(matches!(err, SyncError::MissingKeyColumn(_)));
    }

    #[test]
    fn test_decode_progress() {
        let event = decoder().decode(RawRow::progress(42)).unwrap();
        assert_eq!(event, SourceEvent::Progress { ts: 42 });
    }

    #[test]
    fn test_decode_snapshot() {
        let event = decoder()
            .decode(RawRow::snapshot(cells("o1", "NEW")))
            .unwrap();
        match event {
            SourceEvent::Snapshot { key, row } => {
                assert_eq!(key, "o1");
                assert_eq!(row.get("status").unwrap().as_key().unwrap(), "NEW");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_insert_and_retract() {
        let insert = decoder()
            .decode(RawRow::change(7, 1, cells("o1", "NEW")))
            .unwrap();
        assert!(matches!(
            insert,
            SourceEvent::Change {
                ts: 7,
                diff: Diff::Insert,
                ..
            }
        ));

        let retract = decoder()
            .decode(RawRow::change(8, -1, cells("o1", "NEW")))
            .unwrap();
        assert!(matches!(
            retract,
            SourceEvent::Change {
                ts: 8,
                diff: Diff::Retract,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_wide_diff() {
        let err = decoder()
            .decode(RawRow::change(7, 2, cells("o1", "NEW")))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedDiff { diff: 2, .. }));
    }

    #[test]
    fn test_decode_rejects_missing_ts() {
        let raw = RawRow {
            ts: None,
            diff: Some(1),
            progress: false,
            cells: cells("o1", "NEW"),
        };
        let err = decoder().decode(raw).unwrap_err();
        assert!(matches!(err, SyncError::MissingTimestamp));
    }

    #[test]
    fn test_decode_rejects_null_key() {
        let raw = RawRow::change(7, 1, vec![None, Some("NEW".into())]);
        let err = decoder().decode(raw).unwrap_err();
        assert!(matches!(err, SyncError::MissingKeyColumn(_)));
    }

    #[test]
    fn test_progress_requires_ts() {
        let raw = RawRow {
            ts: None,
            diff: None,
            progress: true,
            cells: Vec::new(),
        };
        let err = decoder().decode(raw).unwrap_err();
        assert!(matches!(err, SyncError::MissingTimestamp));
    }
}
