//! # FreshSync Connectors
//!
//! Concrete endpoints for the FreshSync synchronization core:
//!
//! - [`upstream`] — the Materialize connector (relational wire
//!   protocol, `SUBSCRIBE` with progress marks and snapshots)
//! - [`search`] — the bulk full-text index sink
//! - [`broadcast`] — the WebSocket fan-out sink
//!
//! All three implement the seams defined in `freshsync-core`
//! (`UpstreamConnector` / `SinkAdapter`) and are wired together by
//! `freshsync-server`.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(clippy::too_many_lines, clippy::cast_possible_truncation)
)]

/// WebSocket broadcast sink.
pub mod broadcast;

/// Bulk search-index sink.
pub mod search;

/// Materialize upstream connector.
pub mod upstream;
