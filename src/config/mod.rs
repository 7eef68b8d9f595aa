//! Configuration management for the edge proxy.
//!
//! Settings are layered: built-in defaults, an optional TOML file,
//! `EDGE__SECTION__KEY` environment variables and finally command-line flags.

use std::env;
use clap::Parser;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::core::balancer::Algorithm;
use crate::models::Config;

/// Command-line flags. Every flag overrides the matching configuration key.
#[derive(Debug, Default, Parser)]
#[command(name = "edge-proxy", about = "Reverse proxy load balancer with DDoS protection")]
pub struct CliArgs {
    /// Configuration file (defaults to $CONFIG_FILE or config/default.toml)
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Port to run the proxy on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Comma-separated backend URLs, e.g. http://localhost:5000,http://localhost:5001
    #[arg(short = 'b', long, value_delimiter = ',')]
    pub backends: Option<Vec<String>>,

    /// Number of backend nodes derived from the base port
    #[arg(short = 'n', long)]
    pub nodes: Option<u16>,

    /// Base port of the derived backend nodes
    #[arg(long)]
    pub base_port: Option<u16>,

    /// Load-balancing algorithm
    #[arg(short = 'a', long, value_enum)]
    pub algorithm: Option<Algorithm>,

    /// Health check interval in seconds
    #[arg(short = 'i', long)]
    pub health_interval: Option<u64>,

    /// Health check timeout in seconds
    #[arg(short = 't', long)]
    pub health_timeout: Option<u64>,

    /// Enable sticky sessions
    #[arg(short = 's', long)]
    pub sticky_sessions: bool,
}

impl CliArgs {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(backends) = &self.backends {
            config.cluster.nodes = backends
                .iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect();
        }
        if let Some(nodes) = self.nodes {
            config.cluster.node_count = nodes;
        }
        if let Some(base_port) = self.base_port {
            config.cluster.base_port = base_port;
        }
        if let Some(algorithm) = self.algorithm {
            config.cluster.algorithm = algorithm;
        }
        if let Some(interval) = self.health_interval {
            config.cluster.health_check_interval = interval;
        }
        if let Some(timeout) = self.health_timeout {
            config.cluster.health_check_timeout = timeout;
        }
        if self.sticky_sessions {
            config.cluster.sticky_sessions = true;
        }
    }
}

/// Load configuration from defaults, the config file and the environment
pub fn load_config(config_file: Option<&str>) -> Result<Config, ConfigError> {
    let config_file = config_file
        .map(str::to_string)
        .or_else(|| env::var("CONFIG_FILE").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(ConfigBuilder::try_from(&Config::default())?)
        .add_source(File::with_name(&config_file).required(false))
        .add_source(
            Environment::with_prefix("EDGE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cluster.nodes")
                .with_list_parse_key("blacklist.whitelist")
                .with_list_parse_key("geo.blocked_countries")
                .with_list_parse_key("geo.allowed_countries")
                .with_list_parse_key("cache.vary_headers"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Some("does/not/exist.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.cluster.algorithm, Algorithm::RoundRobin);
        assert_eq!(config.blacklist.violation_threshold, 5);
    }

    #[test]
    fn cli_flags_override_config() {
        let args = CliArgs::parse_from([
            "edge-proxy",
            "--port",
            "9000",
            "--backends",
            "http://a:1,http://b:2",
            "--algorithm",
            "least_connections",
            "--sticky-sessions",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.cluster.nodes, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.cluster.algorithm, Algorithm::LeastConnections);
        assert!(config.cluster.sticky_sessions);
    }
}
