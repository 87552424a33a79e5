//! Supervisor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the preview supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Log entries retained per preview session
    pub log_capacity: usize,
    /// How long to watch output for a URL before falling back to the default port
    pub detection_window_ms: u64,
    /// Time between SIGTERM and SIGKILL
    pub grace_period_ms: u64,
    pub install_timeout_secs: u64,
    /// Previews untouched for this long are stopped. Zero disables the reaper.
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    /// Automatic fix attempts after a startup crash
    pub max_fix_attempts: u32,
    /// First port tried when a free port is needed
    pub port_range_start: u16,
    pub port_search_attempts: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            detection_window_ms: 30_000,
            grace_period_ms: 5_000,
            install_timeout_secs: 300,
            idle_timeout_secs: 1_800,
            reaper_interval_secs: 60,
            max_fix_attempts: 1,
            port_range_start: 3000,
            port_search_attempts: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn with_detection_window(mut self, window: Duration) -> Self {
        self.detection_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_fix_attempts(mut self, attempts: u32) -> Self {
        self.max_fix_attempts = attempts;
        self
    }

    pub fn detection_window(&self) -> Duration {
        Duration::from_millis(self.detection_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// `None` when idle reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.log_capacity, 500);
        assert_eq!(config.detection_window(), Duration::from_secs(30));
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_zero_idle_timeout_disables_reaper() {
        let config = SupervisorConfig::default().with_idle_timeout(Duration::ZERO);
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"detectionWindowMs": 1500}"#).unwrap();
        assert_eq!(config.detection_window(), Duration::from_millis(1500));
        assert_eq!(config.max_fix_attempts, 1);
    }
}
