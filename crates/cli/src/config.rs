// Tunnel Panel - CLI Config Module
// Handles CLI configuration for connecting to the daemon

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// CLI configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CliConfig {
    /// Base URL of the daemon's REST API
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CliConfig {
    /// Load CLI configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            // Return default config if file doesn't exist
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read CLI configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse CLI configuration")?;

        Ok(config)
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnel-panel").join("cli.toml"))
    }

    /// Daemon URL with a scheme and without a trailing slash
    pub fn daemon_base_url(&self) -> Result<String> {
        let url = self.daemon_url.trim().trim_end_matches('/');
        if url.is_empty() {
            anyhow::bail!("daemon_url is empty");
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(url.to_string())
        } else {
            Ok(format!("http://{}", url))
        }
    }

    /// Create an HTTP client configured to talk to the daemon
    pub fn create_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .context("Failed to build daemon client")
    }
}
