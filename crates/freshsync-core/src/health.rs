//! Pipeline health reporting for the orchestrator's probes.

use std::fmt;

/// Health of one pipeline as exposed by the probe endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Streaming normally.
    Healthy,
    /// Operational but impaired (e.g. reconnecting).
    Degraded(String),
    /// Halted; contains the failure description.
    Unhealthy(String),
    /// Not yet determined (pipeline still starting).
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Returns `true` only for [`HealthStatus::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Returns `true` while the pipeline can still make progress.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded(msg) => write!(f, "Degraded: {msg}"),
            HealthStatus::Unhealthy(msg) => write!(f, "Unhealthy: {msg}"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_checks() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Healthy.is_operational());

        let degraded = HealthStatus::Degraded("reconnecting".into());
        assert!(!degraded.is_healthy());
        assert!(degraded.is_operational());

        let unhealthy = HealthStatus::Unhealthy("view not found".into());
        assert!(!unhealthy.is_operational());

        assert!(!HealthStatus::Unknown.is_operational());
    }

    #[test]
    fn test_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert!(HealthStatus::Degraded("slow".into())
            .to_string()
            .contains("slow"));
    }
}
