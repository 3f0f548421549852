use nexus_protocol::{
    DEFAULT_BEACON_INTERVAL_SECS, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_PORT,
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS, DISCOVERY_MAGIC, MAX_POLL_INTERVAL_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV_VAR: &str = "NEXUS_COORDINATOR_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "coordinator.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub service_port: u16,
    /// A stream that stays silent this long is treated as disconnected.
    pub stream_idle_timeout_secs: u64,
    pub billing: BillingConf,
    pub store: StoreConf,
    pub discovery: DiscoveryConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BillingConf {
    pub hourly_rate: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Json,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConf {
    pub enabled: bool,
    pub port: u16,
    pub interval_secs: u64,
    pub magic: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub enabled: bool,
    pub port: u16,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service_port: DEFAULT_SERVICE_PORT,
            stream_idle_timeout_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            billing: BillingConf::default(),
            store: StoreConf::default(),
            discovery: DiscoveryConf::default(),
            http: HttpConf::default(),
        }
    }
}

impl Default for BillingConf {
    fn default() -> Self {
        Self { hourly_rate: 50_000 }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            path: PathBuf::from("./data/sessions.json"),
            flush_interval_secs: 2,
        }
    }
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DISCOVERY_PORT,
            interval_secs: DEFAULT_BEACON_INTERVAL_SECS,
            magic: DISCOVERY_MAGIC.to_string(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.billing.hourly_rate <= 0 {
            return Err(ConfigError::Invalid("billing.hourly_rate must be positive".into()));
        }
        if self.stream_idle_timeout_secs <= MAX_POLL_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "stream_idle_timeout_secs must be > {MAX_POLL_INTERVAL_SECS} (agent poll ceiling)"
            )));
        }
        if self.store.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("store.flush_interval_secs must be > 0".into()));
        }
        if self.discovery.enabled {
            if self.discovery.interval_secs == 0 {
                return Err(ConfigError::Invalid("discovery.interval_secs must be > 0".into()));
            }
            if self.discovery.magic.trim().is_empty() {
                return Err(ConfigError::Invalid("discovery.magic must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Loads `coordinator.yaml` (or `$NEXUS_COORDINATOR_CONFIG`).
/// A missing file means defaults; a broken one aborts startup.
pub async fn load_config() -> Result<CoordinatorConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let path_str = path.display().to_string();
    if !path.exists() {
        warn!(path = %path_str, "no coordinator config file, using defaults");
        return Ok(CoordinatorConfig::default());
    }

    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path_str.clone(),
        source,
    })?;

    let cfg = if txt.trim().is_empty() {
        CoordinatorConfig::default()
    } else {
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path_str.clone(),
            source,
        })?
    };

    cfg.validate()?;
    info!(path = %path_str, "coordinator config loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(cfg.service_port, 50051);
        assert_eq!(cfg.billing.hourly_rate, 50_000);
        assert_eq!(cfg.discovery.port, 9999);
        assert_eq!(cfg.discovery.interval_secs, 3);
    }

    #[tokio::test]
    async fn test_partial_yaml_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "billing:\n  hourly_rate: 60000\ndiscovery:\n  enabled: false").unwrap();

        let cfg = load_config_from(file.path()).await.unwrap();
        assert_eq!(cfg.billing.hourly_rate, 60_000);
        assert!(!cfg.discovery.enabled);
        assert_eq!(cfg.service_port, 50051);
        assert_eq!(cfg.store.backend, StoreBackend::Json);
    }

    #[tokio::test]
    async fn test_invalid_values_abort() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "billing:\n  hourly_rate: 0").unwrap();
        let err = load_config_from(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "service_port: [not a port").unwrap();
        let err = load_config_from(broken.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_idle_timeout_must_exceed_poll_ceiling() {
        let mut cfg = CoordinatorConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.stream_idle_timeout_secs = MAX_POLL_INTERVAL_SECS;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.stream_idle_timeout_secs = MAX_POLL_INTERVAL_SECS + 1;
        assert!(cfg.validate().is_ok());
    }
}
