//! Config file handling

use anyhow::{Context, Result};
use dlsession_core::{CoreConfig, SimulatedConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Everything the CLI can be configured with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(flatten)]
    pub core: CoreConfig,
    pub simulated: SimulatedConfig,
}

impl AppConfig {
    /// Load `path`, or the default config file if it exists, or defaults
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retention = match self.core.terminal_retention_secs {
            Some(secs) => format!("{}s", secs),
            None => "until removed".to_string(),
        };
        writeln!(f, "Command timeout:   {}ms", self.core.command_timeout_ms)?;
        writeln!(f, "Engine timeout:    {}ms", self.core.engine_timeout_ms)?;
        writeln!(f, "Keep finished:     {}", retention)?;
        writeln!(f, "Reap interval:     {}s", self.core.reap_interval_secs)?;
        writeln!(
            f,
            "Simulated engine:  {} bytes in {} byte chunks every {}ms",
            self.simulated.total_bytes, self.simulated.chunk_bytes, self.simulated.tick_ms
        )?;
        if let Some(path) = default_path() {
            write!(f, "Default file:      {}", path.display())?;
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("dlsession").join("config.json"))
}
