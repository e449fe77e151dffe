// Tunnel Panel - Daemon Config Module
// Handles daemon settings (listener, storage paths, status source)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tunnel_panel_common::{is_loopback_bind_address, FingerprintProtocol};

/// Environment variable overriding the daemon settings path
pub const CONFIG_PATH_ENV: &str = "TUNNEL_PANEL_DAEMON_CONFIG";

/// Where tunnel state comes from
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StatusMode {
    /// Classify the tunnel logs in `logs_dir`
    #[default]
    Logs,
    /// Poll `remote_base_url`/status
    Remote,
}

/// Status source settings (`[status]` table)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusSettings {
    #[serde(default)]
    pub mode: StatusMode,

    /// Base URL of the remote status API (remote mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_base_url: Option<String>,

    /// Bearer token sent to the remote status API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_api_key: Option<String>,

    /// Remote poll timeout in milliseconds
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            mode: StatusMode::default(),
            remote_base_url: None,
            remote_api_key: None,
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl StatusSettings {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Listen address for the REST API (e.g., "127.0.0.1:5000")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Directory holding the tunnel document; must exist and belong to the daemon user
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// File name of the tunnel document inside `config_dir`
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,

    /// Backup directory (default: `<config_dir>/backups`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,

    /// Directory the tunnel runner writes `tunnel_<id>.log` files to
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Log file naming contract shared with the tunnel runner
    #[serde(default)]
    pub fingerprint_protocol: FingerprintProtocol,

    #[serde(default)]
    pub status: StatusSettings,
}

fn default_bind_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel-panel")
        .join("tunnels")
}

fn default_config_file_name() -> String {
    "config.yaml".to_string()
}

fn default_logs_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel-panel")
        .join("logs")
}

fn default_remote_timeout_ms() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            config_dir: default_config_dir(),
            config_file_name: default_config_file_name(),
            backup_dir: None,
            logs_dir: default_logs_dir(),
            fingerprint_protocol: FingerprintProtocol::default(),
            status: StatusSettings::default(),
        }
    }
}

impl DaemonConfig {
    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(&self.config_file_name)
    }

    pub fn backup_dir_path(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("backups"))
    }

    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        let file_name = Path::new(&self.config_file_name);
        if self.config_file_name.is_empty()
            || file_name.file_name().map(|n| n != file_name.as_os_str()).unwrap_or(true)
        {
            anyhow::bail!(
                "config_file_name must be a plain file name, got '{}'",
                self.config_file_name
            );
        }

        if self.status.remote_timeout_ms == 0 {
            anyhow::bail!("status.remote_timeout_ms must be greater than 0");
        }

        if self.status.mode == StatusMode::Remote
            && self
                .status
                .remote_base_url
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            warn!("Status mode is 'remote' but no remote_base_url is set; every tunnel will report N/A");
        }

        if !is_loopback_bind_address(&self.bind_address) {
            warn!(
                "bind_address {} is not loopback; the API has no authentication",
                self.bind_address
            );
        }

        Ok(())
    }

    /// Load daemon configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load daemon configuration from `config_path`, writing defaults if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to `config_path`
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        // May hold the remote API key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnel-panel").join("daemon.toml"))
    }
}
