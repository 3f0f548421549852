//! Agent configuration
//!
//! Handles:
//! - Coordinator address (manual) or discovery settings
//! - Polling, reconnect and timeout intervals
//! - Idle-process filter and tracked applications for the probe
//! - Cross-platform storage location

use anyhow::{Context, Result};
use nexus_protocol::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_PORT, DISCOVERY_MAGIC, MAX_POLL_INTERVAL_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Foreground processes that never count as billable activity.
pub const DEFAULT_IDLE_PROCESSES: &[&str] = &[
    "explorer.exe",
    "searchhost.exe",
    "shellexperiencehost.exe",
    "lockapp.exe",
    "taskhostw.exe",
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "windowsterminal.exe",
    "conhost.exe",
    "taskmgr.exe",
    "steam.exe",
    "steamwebhelper.exe",
    "epicgameslauncher.exe",
    "origin.exe",
    "battle.net.exe",
    "discord.exe",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Manual `host:port`. Skips discovery when set.
    pub coordinator: Option<String>,
    /// Overrides the hostname as endpoint id.
    pub endpoint_id: Option<String>,
    pub service_port: u16,
    pub poll_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub discovery: DiscoveryConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub magic: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub idle_processes: Vec<String>,
    /// Process names watched on platforms without a foreground window API.
    pub tracked_apps: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator: None,
            endpoint_id: None,
            service_port: DEFAULT_SERVICE_PORT,
            poll_interval_secs: 5,
            reconnect_backoff_secs: 2,
            connect_timeout_secs: 5,
            response_timeout_secs: 10,
            kill_timeout_secs: 10,
            discovery: DiscoveryConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            magic: DISCOVERY_MAGIC.to_string(),
            timeout_secs: 5,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            idle_processes: DEFAULT_IDLE_PROCESSES.iter().map(|s| s.to_string()).collect(),
            tracked_apps: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, defaults on first run.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no agent config file, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid agent config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given location, creating parent directories.
    #[cfg(test)]
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("nexus-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        // the coordinator drops streams that stay quiet past its idle timeout
        if self.poll_interval_secs == 0 || self.poll_interval_secs > MAX_POLL_INTERVAL_SECS {
            anyhow::bail!("poll_interval_secs must be between 1 and {MAX_POLL_INTERVAL_SECS}");
        }
        if self.discovery.timeout_secs == 0 {
            anyhow::bail!("discovery.timeout_secs must be > 0");
        }
        if self.connect_timeout_secs == 0 || self.response_timeout_secs == 0 {
            anyhow::bail!("connect and response timeouts must be > 0");
        }
        Ok(())
    }

    /// Hostname unless overridden.
    pub fn resolve_endpoint_id(&self) -> String {
        self.endpoint_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.service_port, 50051);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.discovery.port, 9999);
        assert_eq!(config.discovery.timeout_secs, 5);
        assert!(config.probe.idle_processes.iter().any(|p| p == "explorer.exe"));
        assert!(config.coordinator.is_none());
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("nexus-agent"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[tokio::test]
    async fn test_partial_toml_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nexus-agent").join("config.toml");

        assert_eq!(AgentConfig::load_from(&path).await.unwrap().poll_interval_secs, 5);

        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "coordinator = \"10.0.0.2:50051\"\n[probe]\ntracked_apps = [\"cs2\"]\n")
            .await
            .unwrap();
        let loaded = AgentConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.coordinator.as_deref(), Some("10.0.0.2:50051"));
        assert_eq!(loaded.probe.tracked_apps, vec!["cs2".to_string()]);
        assert_eq!(loaded.probe.idle_processes.len(), DEFAULT_IDLE_PROCESSES.len());

        let mut changed = loaded.clone();
        changed.poll_interval_secs = 7;
        changed.save_to(&path).await.unwrap();
        assert_eq!(AgentConfig::load_from(&path).await.unwrap().poll_interval_secs, 7);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "poll_interval_secs = 0\n").await.unwrap();
        assert!(AgentConfig::load_from(&path).await.is_err());
    }

    #[test]
    fn test_poll_interval_ceiling() {
        let mut config = AgentConfig::default();
        config.poll_interval_secs = MAX_POLL_INTERVAL_SECS;
        assert!(config.validate().is_ok());

        config.poll_interval_secs = MAX_POLL_INTERVAL_SECS + 1;
        assert!(config.validate().is_err());

        config.poll_interval_secs = 45;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_id_override() {
        let mut config = AgentConfig::default();
        config.endpoint_id = Some("  PC-07 ".into());
        assert_eq!(config.resolve_endpoint_id(), "PC-07");

        config.endpoint_id = Some("   ".into());
        assert!(!config.resolve_endpoint_id().is_empty());
    }
}
