//! Configuration for the coordination core

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;

/// Timeouts and retention policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Upper bound for a single dispatched command
    pub command_timeout_ms: u64,
    /// Upper bound for a single engine call
    pub engine_timeout_ms: u64,
    /// Evict Complete/Error sessions after this long. `None` keeps them
    /// until they are removed explicitly.
    pub terminal_retention_secs: Option<u64>,
    /// How often the reaper looks for expired sessions
    pub reap_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            engine_timeout_ms: 3_000,
            terminal_retention_secs: None,
            reap_interval_secs: 30,
        }
    }
}

impl CoreConfig {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Init(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, CoreError> {
        serde_json::from_str(content).map_err(|e| CoreError::Init(format!("invalid config: {}", e)))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    pub fn terminal_retention(&self) -> Option<Duration> {
        self.terminal_retention_secs.map(Duration::from_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoreConfig::from_json(r#"{"terminalRetentionSecs": 600}"#).unwrap();
        assert_eq!(config.terminal_retention(), Some(Duration::from_secs(600)));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.reap_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_retention_disabled_by_default() {
        assert_eq!(CoreConfig::default().terminal_retention(), None);
    }

    #[test]
    fn test_invalid_json_is_init_error() {
        let error = CoreConfig::from_json("{").unwrap_err();
        assert!(matches!(error, CoreError::Init(_)));
    }
}
