//! Broadcast sink configuration.

use std::time::Duration;

use freshsync_core::error::SyncError;

/// Settings for the WebSocket broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Listen address (`BROADCAST_LISTEN_ADDR`).
    pub listen_addr: String,
    /// Bounded frames per client queue
    /// (`BROADCAST_CLIENT_QUEUE_CAPACITY`). Overflow terminates the
    /// session.
    pub client_queue_capacity: usize,
    /// Idle interval between pings (`BROADCAST_PING_INTERVAL_SEC`); a
    /// pong must arrive within the same interval.
    pub ping_interval: Duration,
    /// Rows per snapshot frame chunk.
    pub snapshot_chunk_rows: usize,
    /// Deadline for the client's `hello`.
    pub hello_timeout: Duration,
    /// Connection cap; excess connections are refused at accept.
    pub max_connections: usize,
}

impl BroadcastConfig {
    /// Creates a config with the documented defaults.
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            client_queue_capacity: 1024,
            ping_interval: Duration::from_secs(15),
            snapshot_chunk_rows: 500,
            hello_timeout: Duration::from_secs(10),
            max_connections: 4096,
        }
    }

    /// Reads the `BROADCAST_*` settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnresolvableEndpoint`] when a numeric
    /// setting does not parse.
    pub fn from_env() -> Result<Self, SyncError> {
        let listen_addr = std::env::var("BROADCAST_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8765".to_string());
        let mut config = Self::new(listen_addr);
        if let Some(capacity) = env_parsed("BROADCAST_CLIENT_QUEUE_CAPACITY")? {
            config.client_queue_capacity = capacity.max(1);
        }
        if let Some(secs) = env_parsed("BROADCAST_PING_INTERVAL_SEC")? {
            config.ping_interval = Duration::from_secs(secs as u64);
        }
        Ok(config)
    }
}

fn env_parsed(name: &str) -> Result<Option<usize>, SyncError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(text) => text
            .parse()
            .map(Some)
            .map_err(|_| SyncError::UnresolvableEndpoint {
                endpoint: name.to_string(),
                reason: format!("'{text}' is not a number"),
            }),
    }
}
