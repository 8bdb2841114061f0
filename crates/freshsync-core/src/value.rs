//! Dynamic row values and per-view schemas.
//!
//! Upstream rows arrive as ordered lists of text cells over the wire.
//! The column list and types are captured once per view when the
//! connector opens ([`ViewSchema`]); after that, all access is by column
//! index. Cell text is parsed into typed [`Value`]s according to the
//! declared [`ColumnType`] — never silently coerced.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::SyncError;

/// A single scalar (or nested) payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point (also carries upstream `numeric` values).
    Float(f64),
    /// Text.
    String(String),
    /// Timestamp, always normalized to UTC.
    Timestamp(DateTime<Utc>),
    /// Nested structured value (`json` / `jsonb` columns).
    Json(serde_json::Value),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders this value as a row key.
    ///
    /// Returns `None` for NULL or empty-text values, which are not valid
    /// keys.
    #[must_use]
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Json(_) => None,
        }
    }

    /// Converts this value into a JSON document field.
    ///
    /// Timestamps become ISO-8601 UTC strings. Non-finite floats are
    /// rejected rather than silently dropped.
    ///
    /// # Errors
    ///
    /// Returns a reason string when the value has no JSON representation.
    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        match self {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(i) => Ok(serde_json::Value::Number((*i).into())),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| format!("non-finite float {f}")),
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Timestamp(ts) => Ok(serde_json::Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Value::Json(v) => Ok(v.clone()),
        }
    }
}

/// Declared type of an upstream column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Boolean.
    Bool,
    /// Any integer width.
    Int,
    /// Floating-point and arbitrary-precision numerics.
    Float,
    /// Text-like types; also the fallback for unrecognized types.
    Text,
    /// Timestamps, with or without time zone.
    Timestamp,
    /// `json` / `jsonb`.
    Json,
}

impl ColumnType {
    /// Maps an upstream type name (as reported by `SHOW COLUMNS`) to a
    /// column type. Unrecognized names degrade to [`ColumnType::Text`],
    /// which round-trips any value losslessly.
    #[must_use]
    pub fn from_upstream(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "boolean" | "bool" => ColumnType::Bool,
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "oid" | "uint2"
            | "uint4" | "uint8" => ColumnType::Int,
            "real" | "double precision" | "float4" | "float8" => ColumnType::Float,
            "json" | "jsonb" => ColumnType::Json,
            _ if lower.starts_with("numeric") || lower.starts_with("decimal") => {
                ColumnType::Float
            }
            _ if lower.starts_with("timestamp") => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }

    /// Parses a text-protocol cell into a typed [`Value`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnparseableColumn`] when the text does not
    /// conform to the declared type.
    pub fn parse_text(self, column: &str, text: &str) -> Result<Value, SyncError> {
        let unparseable = || SyncError::UnparseableColumn {
            column: column.to_string(),
            value: text.to_string(),
            ty: self.to_string(),
        };
        match self {
            ColumnType::Bool => match text {
                "t" | "true" => Ok(Value::Bool(true)),
                "f" | "false" => Ok(Value::Bool(false)),
                _ => Err(unparseable()),
            },
            ColumnType::Int => text.parse().map(Value::Int).map_err(|_| unparseable()),
            ColumnType::Float => text.parse().map(Value::Float).map_err(|_| unparseable()),
            ColumnType::Text => Ok(Value::String(text.to_string())),
            ColumnType::Timestamp => parse_timestamp(text)
                .map(Value::Timestamp)
                .ok_or_else(unparseable),
            ColumnType::Json => serde_json::from_str(text)
                .map(Value::Json)
                .map_err(|_| unparseable()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        };
        write!(f, "{name}")
    }
}

/// Parses the timestamp formats the upstream text protocol produces.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff][+TZ]`, and bare dates.
/// Naive values are taken as UTC.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// One column of a view schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name as reported upstream.
    pub name: String,
    /// Declared type.
    pub ty: ColumnType,
}

impl ColumnDef {
    /// Creates a column definition.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// The ordered column list of one view, captured at connector open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSchema {
    /// View name.
    pub view: String,
    /// Ordered columns.
    pub columns: Vec<ColumnDef>,
}

impl ViewSchema {
    /// Creates a schema from a view name and column list.
    #[must_use]
    pub fn new(view: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            view: view.into(),
            columns,
        }
    }

    /// Returns the index of a column by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` when the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

}

/// One parsed row of a view. Cheap to clone relative to its payload; the
/// schema handle is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Schema of the owning view.
    pub schema: Arc<ViewSchema>,
    /// Values in column order.
    pub values: Vec<Value>,
}

impl Row {
    /// Parses a row of text cells against a schema.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ColumnCountMismatch`] on arity mismatch, or
    /// [`SyncError::UnparseableColumn`] when a cell fails to parse.
    pub fn parse(schema: &Arc<ViewSchema>, cells: &[Option<String>]) -> Result<Self, SyncError> {
        if cells.len() != schema.columns.len() {
            return Err(SyncError::ColumnCountMismatch {
                got: cells.len(),
                want: schema.columns.len(),
            });
        }
        let mut values = Vec::with_capacity(cells.len());
        for (def, cell) in schema.columns.iter().zip(cells) {
            let value = match cell {
                None => Value::Null,
                Some(text) => def.ty.parse_text(&def.name, text)?,
            };
            values.push(value);
        }
        Ok(Self {
            schema: Arc::clone(schema),
            values,
        })
    }

    /// Returns the value at a column index.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Looks a value up by column name. Prefer [`Row::value_at`] with a
    /// pre-resolved index on hot paths.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|i| self.value_at(i))
    }

    /// Converts the row into a JSON object.
    ///
    /// When `skip_reserved` is set, columns whose names begin with `_`
    /// are dropped (they are upstream bookkeeping, not payload).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShapeError`] when a value has no JSON
    /// representation.
    pub fn to_json_object(
        &self,
        skip_reserved: bool,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SyncError> {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (def, value) in self.schema.columns.iter().zip(&self.values) {
            if skip_reserved && def.name.starts_with('_') {
                continue;
            }
            let json = value.to_json().map_err(|reason| SyncError::ShapeError {
                column: def.name.clone(),
                reason,
            })?;
            map.insert(def.name.clone(), json);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schema() -> Arc<ViewSchema> {
        Arc::new(ViewSchema::new(
            "orders",
            vec![
                ColumnDef::new("order_id", ColumnType::Text),
                ColumnDef::new("total", ColumnType::Float),
                ColumnDef::new("line_count", ColumnType::Int),
                ColumnDef::new("rush", ColumnType::Bool),
                ColumnDef::new("delivery_eta", ColumnType::Timestamp),
                ColumnDef::new("_internal", ColumnType::Text),
            ],
        ))
    }

    fn cells(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_column_type_from_upstream() {
        assert_eq!(ColumnType::from_upstream("bigint"), ColumnType::Int);
        assert_eq!(ColumnType::from_upstream("numeric(38,2)"), ColumnType::Float);
        assert_eq!(
            ColumnType::from_upstream("timestamp with time zone"),
            ColumnType::Timestamp
        );
        assert_eq!(ColumnType::from_upstream("jsonb"), ColumnType::Json);
        assert_eq!(ColumnType::from_upstream("uuid"), ColumnType::Text);
    }

    #[test]
    fn test_parse_row() {
        let row = Row::parse(
            &schema(),
            &cells(&[
                Some("o-1001"),
                Some("42.50"),
                Some("3"),
                Some("t"),
                Some("2024-05-01 12:30:00+00"),
                None,
            ]),
        )
        .unwrap();

        assert_eq!(row.get("order_id"), Some(&Value::String("o-1001".into())));
        assert_eq!(row.get("total"), Some(&Value::Float(42.5)));
        assert_eq!(row.get("line_count"), Some(&Value::Int(3)));
        assert_eq!(row.get("rush"), Some(&Value::Bool(true)));
        assert!(row.get("_internal").unwrap().is_null());

        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(row.get("delivery_eta"), Some(&Value::Timestamp(expected)));
    }

    #[test]
    fn test_parse_row_arity_mismatch() {
        let err = Row::parse(&schema(), &cells(&[Some("o-1")])).unwrap_err();
        assert!(matches!(err, SyncError::ColumnCountMismatch { got: 1, want: 6 }));
    }

    #[test]
    fn test_parse_row_bad_cell() {
        let err = Row::parse(
            &schema(),
            &cells(&[
                Some("o-1"),
                Some("not-a-number"),
                Some("3"),
                Some("t"),
                None,
                None,
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::UnparseableColumn { .. }));
        assert!(err.to_string().contains("total"));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T12:30:00Z").is_some());
        assert!(parse_timestamp("2024-05-01 12:30:00.123+00").is_some());
        assert!(parse_timestamp("2024-05-01 12:30:00").is_some());
        assert!(parse_timestamp("2024-05-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_value_as_key() {
        assert_eq!(Value::String("o1".into()).as_key(), Some("o1".into()));
        assert_eq!(Value::Int(42).as_key(), Some("42".into()));
        assert_eq!(Value::Null.as_key(), None);
        assert_eq!(Value::String(String::new()).as_key(), None);
    }

    #[test]
    fn test_to_json_object_drops_reserved_and_formats_timestamps() {
        let row = Row::parse(
            &schema(),
            &cells(&[
                Some("o-1"),
                Some("10"),
                Some("1"),
                Some("f"),
                Some("2024-05-01 00:00:00+00"),
                Some("scratch"),
            ]),
        )
        .unwrap();

        let obj = row.to_json_object(true).unwrap();
        assert!(!obj.contains_key("_internal"));
        assert_eq!(
            obj.get("delivery_eta").unwrap(),
            &serde_json::json!("2024-05-01T00:00:00.000Z")
        );

        let full = row.to_json_object(false).unwrap();
        assert!(full.contains_key("_internal"));
    }

    #[test]
    fn test_to_json_rejects_non_finite() {
        let value = Value::Float(f64::NAN);
        assert!(value.to_json().is_err());
    }
}
