//! NexusOps Agent - endpoint side of the session coordinator
//!
//! Runs on every gaming PC:
//! - Samples the foreground activity on a fixed interval
//! - Streams it to the coordinator, found by address or LAN beacon
//! - Closes the active game when the coordinator says so
//! - Reconnects forever with a fixed backoff

mod config;
mod discovery;
mod execution;
mod probe;
mod resilience;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentConfig;
use execution::CommandExecutor;
use probe::SystemProbe;
use resilience::Agent;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nexus-agent")]
#[command(about = "Reports foreground activity to the NexusOps coordinator")]
#[command(version)]
struct Cli {
    /// Coordinator address (host:port). Disables discovery.
    #[arg(long, value_name = "ADDR")]
    server: Option<String>,

    /// Config file, defaults to the per-user config directory
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Polling interval in seconds
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Endpoint id, defaults to the hostname
    #[arg(long)]
    endpoint_id: Option<String>,
}

impl Cli {
    fn apply(self, mut config: AgentConfig) -> AgentConfig {
        if let Some(server) = self.server {
            config.coordinator = Some(server);
        }
        if let Some(interval) = self.interval {
            config.poll_interval_secs = interval;
        }
        if let Some(endpoint_id) = self.endpoint_id {
            config.endpoint_id = Some(endpoint_id);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AgentConfig::load_from(path).await,
        None => AgentConfig::load().await,
    }
    .context("Failed to load agent config")?;
    let config = cli.apply(config);
    config.validate().context("Invalid agent config")?;

    info!(
        endpoint = %config.resolve_endpoint_id(),
        coordinator = config.coordinator.as_deref().unwrap_or("<discovery>"),
        interval_secs = config.poll_interval_secs,
        "NexusOps agent starting"
    );

    let probe = SystemProbe::new(&config.probe);
    let terminator = CommandExecutor::new(config.kill_timeout());
    let mut agent = Agent::new(config, Box::new(probe), Arc::new(terminator));

    tokio::select! {
        _ = agent.run_forever() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "nexus-agent",
            "--server",
            "192.168.1.10:50051",
            "--interval",
            "3",
            "--endpoint-id",
            "PC-12",
        ]);
        let config = cli.apply(AgentConfig::default());
        assert_eq!(config.coordinator.as_deref(), Some("192.168.1.10:50051"));
        assert_eq!(config.poll_interval_secs, 3);
        assert_eq!(config.resolve_endpoint_id(), "PC-12");
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::parse_from(["nexus-agent"]);
        let mut base = AgentConfig::default();
        base.poll_interval_secs = 9;
        let config = cli.apply(base);
        assert!(config.coordinator.is_none());
        assert_eq!(config.poll_interval_secs, 9);
    }

    #[test]
    fn test_interval_flag_above_ceiling_is_rejected() {
        let cli = Cli::parse_from(["nexus-agent", "--interval", "45"]);
        assert!(cli.apply(AgentConfig::default()).validate().is_err());
    }
}
