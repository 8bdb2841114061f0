//! Pipeline descriptor parsing.
//!
//! The orchestrator reads a static descriptor file at startup, one
//! pipeline per line:
//!
//! ```text
//! # view,sink,key_column[,shape_id]
//! orders_search_source,search,order_id
//! orders_search_source,broadcast,order_id
//! courier_positions,broadcast,courier_id
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::SyncError;

/// Which sink adapter a pipeline feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// Full-text search index (bulk HTTP).
    Search,
    /// WebSocket broadcaster.
    Broadcast,
}

impl FromStr for SinkKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(SinkKind::Search),
            "broadcast" => Ok(SinkKind::Broadcast),
            other => Err(SyncError::InvalidDescriptor(format!(
                "unknown sink kind '{other}' (expected 'search' or 'broadcast')"
            ))),
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Search => write!(f, "search"),
            SinkKind::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// One `(view, sink)` pipeline to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    /// Upstream view name.
    pub view: String,
    /// Destination sink.
    pub sink: SinkKind,
    /// Column holding the row key.
    pub key_column: String,
    /// Document shape to apply (search sink); `"identity"` by default.
    pub shape_id: String,
}

impl PipelineDescriptor {
    /// Stable identifier for logs and probes: `view→sink`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}\u{2192}{}", self.view, self.sink)
    }
}

/// Parses descriptor file contents.
///
/// Blank lines and `#` comments are skipped. Duplicate `(view, sink)`
/// pairs are rejected — two pipelines writing the same sink state would
/// race each other.
///
/// # Errors
///
/// Returns [`SyncError::InvalidDescriptor`] naming the offending line.
pub fn parse_descriptors(text: &str) -> Result<Vec<PipelineDescriptor>, SyncError> {
    let mut descriptors: Vec<PipelineDescriptor> = Vec::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if !(3..=4).contains(&fields.len()) {
            return Err(SyncError::InvalidDescriptor(format!(
                "line {}: expected 'view,sink,key_column[,shape_id]', got '{line}'",
                lineno + 1
            )));
        }
        if fields.iter().take(3).any(|f| f.is_empty()) {
            return Err(SyncError::InvalidDescriptor(format!(
                "line {}: empty field in '{line}'",
                lineno + 1
            )));
        }
        let descriptor = PipelineDescriptor {
            view: fields[0].to_string(),
            sink: fields[1].parse()?,
            key_column: fields[2].to_string(),
            shape_id: fields
                .get(3)
                .filter(|s| !s.is_empty())
                .unwrap_or(&"identity")
                .to_string(),
        };
        if descriptors
            .iter()
            .any(|d| d.view == descriptor.view && d.sink == descriptor.sink)
        {
            return Err(SyncError::InvalidDescriptor(format!(
                "line {}: duplicate pipeline {}",
                lineno + 1,
                descriptor.id()
            )));
        }
        descriptors.push(descriptor);
    }
    if descriptors.is_empty() {
        return Err(SyncError::InvalidDescriptor(
            "descriptor file defines no pipelines".to_string(),
        ));
    }
    Ok(descriptors)
}

/// Reads and parses a descriptor file.
///
/// # Errors
///
/// Returns [`SyncError::InvalidDescriptor`] when the file cannot be read
/// or parsed.
pub fn load_descriptors(path: &Path) -> Result<Vec<PipelineDescriptor>, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SyncError::InvalidDescriptor(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_descriptors(&text)
}
