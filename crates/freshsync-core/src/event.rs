//! Raw wire rows and decoded stream events.

use crate::value::Row;

/// A raw row as yielded by the upstream connector, before decoding.
///
/// `cells` holds the view's payload columns in schema order; the
/// `mz_timestamp` / `mz_progressed` / `mz_diff` prefix columns are
/// already split out by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// Logical timestamp, when present.
    pub ts: Option<u64>,
    /// Differential diff, when present. Progress and snapshot rows
    /// carry `None`.
    pub diff: Option<i64>,
    /// Set on progress marker rows.
    pub progress: bool,
    /// Payload cells in column order (`None` = SQL NULL).
    pub cells: Vec<Option<String>>,
}

impl RawRow {
    /// Builds a change row.
    #[must_use]
    pub fn change(ts: u64, diff: i64, cells: Vec<Option<String>>) -> Self {
        Self {
            ts: Some(ts),
            diff: Some(diff),
            progress: false,
            cells,
        }
    }

    /// Builds a progress marker row.
    #[must_use]
    pub fn progress(ts: u64) -> Self {
        Self {
            ts: Some(ts),
            diff: None,
            progress: true,
            cells: Vec::new(),
        }
    }

    /// Builds a snapshot row (no timestamp, no diff).
    #[must_use]
    pub fn snapshot(cells: Vec<Option<String>>) -> Self {
        Self {
            ts: None,
            diff: None,
            progress: false,
            cells,
        }
    }
}

/// Direction of a differential change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diff {
    /// Row addition (+1).
    Insert,
    /// Row removal (−1).
    Retract,
}

impl Diff {
    /// The diff as a signed integer.
    #[must_use]
    pub fn signum(self) -> i64 {
        match self {
            Diff::Insert => 1,
            Diff::Retract => -1,
        }
    }
}

/// A decoded event from the differential stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A row of the initial snapshot.
    Snapshot {
        /// Row key.
        key: String,
        /// Row payload.
        row: Row,
    },
    /// A progress marker: no future change will carry a smaller
    /// timestamp.
    Progress {
        /// The progress timestamp.
        ts: u64,
    },
    /// A single differential change.
    Change {
        /// Logical timestamp of the owning transaction.
        ts: u64,
        /// Change direction.
        diff: Diff,
        /// Row key.
        key: String,
        /// Row payload.
        row: Row,
    },
}
