//! Search sink configuration.

use std::time::Duration;

use freshsync_core::error::SyncError;

/// Settings for the bulk search-index sink.
#[derive(Debug, Clone)]
pub struct SearchSinkConfig {
    /// Base endpoint URL (`SINK_SEARCH_URL`), e.g. `http://search:9200`.
    pub base_url: String,
    /// Max documents per bulk request (`SINK_SEARCH_BULK_MAX_DOCS`).
    pub bulk_max_docs: usize,
    /// Max body bytes per bulk request (`SINK_SEARCH_BULK_MAX_BYTES`).
    pub bulk_max_bytes: usize,
    /// In-flight bulk requests during hydration.
    pub hydrate_window: usize,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Pause before retrying a failed sub-batch once.
    pub item_retry_delay: Duration,
}

impl SearchSinkConfig {
    /// Creates a config with the documented defaults.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bulk_max_docs: 500,
            bulk_max_bytes: 4 * 1024 * 1024,
            hydrate_window: 4,
            request_timeout: Duration::from_secs(30),
            item_retry_delay: Duration::from_millis(250),
        }
    }

    /// Reads `SINK_SEARCH_URL` and the bulk bounds from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingConfig`] when the URL is absent, or
    /// [`SyncError::UnresolvableEndpoint`] when a bound does not parse.
    pub fn from_env() -> Result<Self, SyncError> {
        let base_url = std::env::var("SINK_SEARCH_URL")
            .map_err(|_| SyncError::MissingConfig("SINK_SEARCH_URL".to_string()))?;
        let mut config = Self::new(base_url);
        if let Some(docs) = env_parsed("SINK_SEARCH_BULK_MAX_DOCS")? {
            config.bulk_max_docs = docs;
        }
        if let Some(bytes) = env_parsed("SINK_SEARCH_BULK_MAX_BYTES")? {
            config.bulk_max_bytes = bytes;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SearchSinkConfig::new("http://search:9200/");
        assert_eq!(config.base_url, "http://search:9200");
        assert_eq!(config.bulk_max_docs, 500);
        assert_eq!(config.bulk_max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.hydrate_window, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.item_retry_delay, Duration::from_millis(250));
    }
}
