//! Process configuration assembly.
//!
//! Everything comes from the environment plus the descriptor file; any
//! failure here is fatal for the whole process (exit code 1).

use std::path::Path;
use std::time::Duration;

use freshsync_connectors::broadcast::BroadcastConfig;
use freshsync_connectors::search::SearchSinkConfig;
use freshsync_connectors::upstream::UpstreamConfig;
use freshsync_core::descriptor::{load_descriptors, PipelineDescriptor, SinkKind};
use freshsync_core::error::SyncError;
use freshsync_core::pipeline::PipelineConfig;
use freshsync_core::retry::RetryPolicy;

/// Fully resolved process configuration.
#[derive(Debug)]
pub struct ServerConfig {
    /// Pipelines to run.
    pub descriptors: Vec<PipelineDescriptor>,
    /// Upstream connection settings.
    pub upstream: UpstreamConfig,
    /// Search sink settings; present when any descriptor targets it.
    pub search: Option<SearchSinkConfig>,
    /// Broadcast settings; used when any descriptor targets it.
    pub broadcast: BroadcastConfig,
    /// Per-pipeline tunables (shared).
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    /// Loads the descriptor file and the environment.
    ///
    /// # Errors
    ///
    /// Returns a config-class [`SyncError`] on any missing or malformed
    /// setting.
    pub fn load(descriptor_path: &Path) -> Result<Self, SyncError> {
        let descriptors = load_descriptors(descriptor_path)?;
        let upstream = UpstreamConfig::from_env()?;
        let search = if descriptors.iter().any(|d| d.sink == SinkKind::Search) {
            Some(SearchSinkConfig::from_env()?)
        } else {
            None
        };
        let broadcast = BroadcastConfig::from_env()?;
        let pipeline = PipelineConfig {
            retry: retry_from_env()?,
            ..PipelineConfig::default()
        };
        Ok(Self {
            descriptors,
            upstream,
            search,
            broadcast,
            pipeline,
        })
    }

    /// Whether any pipeline feeds the broadcaster.
    #[must_use]
    pub fn needs_broadcast(&self) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.sink == SinkKind::Broadcast)
    }
}

/// Builds the reconnect schedule from `RETRY_*`, falling back to the
/// documented defaults (1 s, ×2, capped at 30 s).
fn retry_from_env() -> Result<RetryPolicy, SyncError> {
    let defaults = RetryPolicy::default();
    let initial = env_millis("RETRY_INITIAL_DELAY_MS")?.unwrap_or(defaults.initial);
    let max = env_millis("RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.max);
    let multiplier = match std::env::var("RETRY_BACKOFF_MULTIPLIER") {
        Err(_) => defaults.multiplier,
        Ok(text) => text
            .parse()
            .map_err(|_| SyncError::UnresolvableEndpoint {
                endpoint: "RETRY_BACKOFF_MULTIPLIER".to_string(),
                reason: format!("'{text}' is not a number"),
            })?,
    };
    Ok(RetryPolicy::new(initial, max, multiplier))
}

fn env_millis(name: &str) -> Result<Option<Duration>, SyncError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(text) => text
            .parse()
            .map(Duration::from_millis)
            .map(Some)
            .map_err(|_| SyncError::UnresolvableEndpoint {
                endpoint: name.to_string(),
                reason: format!("'{text}' is not a number"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_requires_descriptor_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/pipelines.conf")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_load_requires_upstream_url() {
        // UPSTREAM_URL is unset in the test environment.
        let mut file = tempfile_path();
        writeln!(file.1, "orders_search_source,broadcast,order_id").unwrap();
        drop(file.1);
        let err = ServerConfig::load(&file.0).unwrap_err();
        assert!(err.is_config());
        std::fs::remove_file(&file.0).ok();
    }

    fn tempfile_path() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "freshsync-test-{}.conf",
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
