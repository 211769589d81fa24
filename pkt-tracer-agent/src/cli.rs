use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use pkt_tracer_types::config;

/// pkt-tracer-agent - host-side packet trace collection pipeline
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the agent configuration file
    #[arg(long, env = config::AGENT_CONFIG_ENV_VAR, default_value = config::AGENT_CONFIG_DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// Hub gRPC address (overrides the config file value)
    #[arg(long, env = "PKTTRACER_TRACEHUB_ADDRESS")]
    pub tracehub_address: Option<String>,

    /// SG directory gRPC address (overrides the config file value)
    #[arg(long, env = "PKTTRACER_SG_ADDRESS")]
    pub sg_address: Option<String>,

    /// Logger level (overrides the config file value)
    #[arg(long, env = "PKTTRACER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log file path; stdout when unset
    #[arg(long, env = "PKTTRACER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Enable gRPC compression to the hub
    #[arg(long, env = "PKTTRACER_COMPRESSION")]
    pub compression: bool,

    /// Graceful shutdown timeout
    #[arg(long, env = "PKTTRACER_GRACEFUL_SHUTDOWN", value_parser = humantime::parse_duration)]
    pub graceful_shutdown: Option<Duration>,

    /// Disable the telemetry HTTP endpoint
    #[arg(long)]
    pub no_telemetry: bool,

    /// user-agent identifier attached to every merged trace
    #[arg(long, env = "PKTTRACER_USER_AGENT")]
    pub user_agent: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Applies CLI/env overrides on top of the file-loaded config, matching
    /// the teacher's layering (file defaults, CLI/env wins).
    pub fn apply_overrides(&self, mut config: config::AgentConfig) -> config::AgentConfig {
        if let Some(addr) = &self.tracehub_address {
            config.tracehub_address = addr.clone();
        }
        if let Some(addr) = &self.sg_address {
            config.sg_address = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.to_string_lossy().to_string());
        }
        if self.compression {
            config.compression = true;
        }
        if let Some(timeout) = self.graceful_shutdown {
            config.graceful_shutdown = timeout;
        }
        if self.no_telemetry {
            config.telemetry_address = None;
        }
        if let Some(ua) = &self.user_agent {
            config.user_agent = ua.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["pkt-tracer-agent", "--config-path", "/tmp/agent.toml"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/agent.toml"));
        assert!(args.tracehub_address.is_none());
        Ok(())
    }

    #[test]
    fn overrides_apply_on_top_of_file_config() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "pkt-tracer-agent",
            "--config-path",
            "/tmp/agent.toml",
            "--tracehub-address",
            "http://hub:9700",
        ])?;
        let cfg = args.apply_overrides(config::AgentConfig::default());
        assert_eq!(cfg.tracehub_address, "http://hub:9700");
        Ok(())
    }
}
