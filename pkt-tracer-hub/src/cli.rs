use clap::Parser;
use std::path::PathBuf;

use pkt_tracer_types::config;

/// pkt-tracer-hub - central ingestion and query service for packet traces
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the hub configuration file
    #[arg(long, env = config::HUB_CONFIG_ENV_VAR, default_value = config::HUB_CONFIG_DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// gRPC listen address (overrides the config file value)
    #[arg(long, env = "PKTTRACER_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// ClickHouse HTTP URL (overrides the config file value)
    #[arg(long, env = "PKTTRACER_CLICKHOUSE_URL")]
    pub clickhouse_url: Option<String>,

    /// ClickHouse database name (overrides the config file value)
    #[arg(long, env = "PKTTRACER_CLICKHOUSE_DATABASE")]
    pub clickhouse_database: Option<String>,

    /// Logger level (overrides the config file value)
    #[arg(long, env = "PKTTRACER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log file path; stdout when unset
    #[arg(long, env = "PKTTRACER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Disable the telemetry HTTP endpoint
    #[arg(long)]
    pub no_telemetry: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Applies CLI/env overrides on top of the file-loaded config, matching
    /// the agent's layering (file defaults, CLI/env wins).
    pub fn apply_overrides(&self, mut config: config::HubConfig) -> config::HubConfig {
        if let Some(addr) = &self.listen_address {
            config.listen_address = addr.clone();
        }
        if let Some(url) = &self.clickhouse_url {
            config.clickhouse_url = url.clone();
        }
        if let Some(db) = &self.clickhouse_database {
            config.clickhouse_database = db.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.to_string_lossy().to_string());
        }
        if self.no_telemetry {
            config.telemetry_address = None;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["pkt-tracer-hub", "--config-path", "/tmp/hub.toml"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/hub.toml"));
        assert!(args.listen_address.is_none());
        Ok(())
    }

    #[test]
    fn overrides_apply_on_top_of_file_config() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "pkt-tracer-hub",
            "--config-path",
            "/tmp/hub.toml",
            "--listen-address",
            "0.0.0.0:9999",
        ])?;
        let cfg = args.apply_overrides(config::HubConfig::default());
        assert_eq!(cfg.listen_address, "0.0.0.0:9999");
        Ok(())
    }
}
