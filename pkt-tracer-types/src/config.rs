//! Shared configuration types for the agent and hub processes.
//!
//! Follows the teacher's `gnosis_vpn_lib::config` layering: a TOML file at a
//! default path (overridable by an env var), parsed into a typed `Config`,
//! with every individual field additionally overridable by `clap`'s `env`
//! attribute on the CLI struct that wraps it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const AGENT_CONFIG_ENV_VAR: &str = "PKTTRACER_AGENT_CONFIG";
pub const AGENT_CONFIG_DEFAULT_PATH: &str = "/etc/pkt-tracer/agent.toml";

pub const HUB_CONFIG_ENV_VAR: &str = "PKTTRACER_HUB_CONFIG";
pub const HUB_CONFIG_DEFAULT_PATH: &str = "/etc/pkt-tracer/hub.toml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("IO error reading configuration: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_table_sync_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_sg_sync_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_netlink_rcvbuf() -> u32 {
    16 * 1024 * 1024
}
fn default_max_rows_in_batch() -> usize {
    10_000
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// Refresh strategy for the SG-network resolver (§4.8).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgSyncMode {
    #[default]
    Pull,
    Push,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    pub tracehub_address: String,
    pub compression: bool,
    #[serde(with = "humantime_serde")]
    pub table_sync_interval: Duration,
    pub sg_address: String,
    #[serde(with = "humantime_serde")]
    pub sg_sync_interval: Duration,
    pub sg_sync_mode: SgSyncMode,
    pub telemetry_address: Option<String>,
    pub metrics_enabled: bool,
    pub healthcheck_enabled: bool,
    pub user_agent: String,
    pub netlink_rcvbuf: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            graceful_shutdown: default_shutdown_timeout(),
            log_level: default_log_level(),
            log_file: None,
            dial_timeout: default_dial_timeout(),
            tracehub_address: "http://127.0.0.1:9700".to_string(),
            compression: false,
            table_sync_interval: default_table_sync_interval(),
            sg_address: "http://127.0.0.1:9800".to_string(),
            sg_sync_interval: default_sg_sync_interval(),
            sg_sync_mode: SgSyncMode::default(),
            telemetry_address: Some("127.0.0.1:9701".to_string()),
            metrics_enabled: true,
            healthcheck_enabled: true,
            user_agent: "pkt-tracer-agent".to_string(),
            netlink_rcvbuf: default_netlink_rcvbuf(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    pub listen_address: String,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    #[serde(default = "default_max_rows_in_batch")]
    pub max_rows_in_batch: usize,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub follow_check_interval: Duration,
    pub telemetry_address: Option<String>,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_true")]
    pub healthcheck_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            log_level: default_log_level(),
            log_file: None,
            listen_address: "0.0.0.0:9700".to_string(),
            clickhouse_url: "http://127.0.0.1:8123".to_string(),
            clickhouse_database: "pkt_tracer".to_string(),
            max_rows_in_batch: default_max_rows_in_batch(),
            flush_interval: default_flush_interval(),
            follow_check_interval: default_check_interval(),
            telemetry_address: Some("127.0.0.1:9702".to_string()),
            metrics_enabled: true,
            healthcheck_enabled: true,
            graceful_shutdown: default_shutdown_timeout(),
        }
    }
}

pub async fn read_agent_config(path: &Path) -> Result<AgentConfig, Error> {
    read(path).await
}

pub async fn read_hub_config(path: &Path) -> Result<HubConfig, Error> {
    read(path).await
}

async fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_defaults_are_sane() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.table_sync_interval, Duration::from_secs(3));
        assert_eq!(cfg.sg_sync_mode, SgSyncMode::Pull);
    }

    #[tokio::test]
    async fn read_agent_config_missing_file_is_no_file() {
        let err = read_agent_config(Path::new("/nonexistent/pkt-tracer-agent.toml")).await.unwrap_err();
        assert!(matches!(err, Error::NoFile));
    }
}
