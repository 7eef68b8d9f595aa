use serde::{Deserialize, Serialize};
use crate::core::anomaly::AnomalyAction;
use crate::core::balancer::Algorithm;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Take the client address from the first `X-Forwarded-For` hop
    pub trust_forwarded_for: bool,
}

/// Backend cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Explicit backend URLs. When empty, `node_count` nodes are derived
    /// from `node_host` and `base_port`.
    pub nodes: Vec<String>,
    /// Number of derived nodes
    pub node_count: u16,
    /// First port of the derived nodes
    pub base_port: u16,
    /// Host of the derived nodes
    pub node_host: String,
    /// Load-balancing algorithm
    pub algorithm: Algorithm,
    /// Whether clients are pinned to the node that first served them
    pub sticky_sessions: bool,
    /// Lifetime of a sticky binding in seconds
    pub sticky_ttl_seconds: u64,
    /// Cookie carrying the client's session token
    pub session_cookie: String,
    /// Maximum concurrent forwarded requests per node (`None` = unbounded)
    pub node_capacity: Option<u64>,
    /// Upstream request timeout in seconds
    pub connection_timeout_seconds: u64,
    /// Extra attempts on a different node after an upstream failure
    pub max_retries: u32,
    /// Seconds between health-check rounds
    pub health_check_interval: u64,
    /// Per-probe timeout in seconds
    pub health_check_timeout: u64,
    /// Consecutive failed probes before a node goes down
    pub failure_threshold: u32,
    /// Consecutive successful probes before a node comes back up
    pub recovery_threshold: u32,
    /// Run one probe round before accepting traffic
    pub initial_probe: bool,
}

impl ClusterConfig {
    /// Backend URLs in registration order.
    pub fn backend_urls(&self) -> Vec<String> {
        if !self.nodes.is_empty() {
            return self.nodes.clone();
        }
        (0..self.node_count)
            .map_while(|i| self.base_port.checked_add(i))
            .map(|port| format!("http://{}:{}", self.node_host, port))
            .collect()
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis for shared counters and cache
    pub enabled: bool,
    /// Redis connection URL
    pub url: String,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default rate limit (requests per window)
    pub default_limit: u32,
    /// Time window in seconds
    pub window_seconds: u32,
}

/// Per-client connection limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLimitConfig {
    /// Maximum concurrent requests per client
    pub max_per_client: u32,
    /// Expiry of the lease counter, guards against stuck counts
    pub lease_timeout_seconds: u64,
    /// Responses slower than this mark the client as slow (seconds)
    pub slow_response_seconds: f64,
    /// How long slow responses are remembered per client (seconds)
    pub slow_tracking_seconds: u64,
}

/// Blacklist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Violations before a client is blacklisted
    pub violation_threshold: u32,
    /// Blacklist duration, also the violation tracking period (seconds)
    pub duration_seconds: u64,
    /// Clients that bypass every protective check
    pub whitelist: Vec<String>,
}

/// Geo filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    pub enabled: bool,
    /// MaxMind country or city database
    pub database_path: String,
    /// ISO codes that are rejected
    pub blocked_countries: Vec<String>,
    /// If non-empty, only these ISO codes are accepted
    pub allowed_countries: Vec<String>,
    /// Let requests through when the country cannot be resolved
    pub fail_open: bool,
}

/// Anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub enabled: bool,
    /// Length of a global aggregation bucket in seconds
    pub bucket_seconds: u64,
    /// Weight of the newest bucket in the baseline
    pub baseline_alpha: f64,
    /// Buckets needed before the baseline is trusted
    pub min_baseline_buckets: u32,
    /// Request-rate multiple of the baseline that counts as anomalous
    pub rate_multiplier: f64,
    /// Error-ratio multiple of the baseline that counts as anomalous
    pub error_multiplier: f64,
    /// Sliding window for per-client tracking in seconds
    pub client_window_seconds: u64,
    /// Fraction of the window's rate budget that flags a client
    pub client_threshold: f64,
    /// What to do when an anomaly is flagged
    pub action: AnomalyAction,
    /// Divisor applied to the rate limit while tightened
    pub tighten_factor: u32,
    /// How long a tightened limit lasts in seconds
    pub tighten_seconds: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default and maximum TTL in seconds
    pub default_ttl_seconds: u64,
    /// Request headers that take part in the cache key
    pub vary_headers: Vec<String>,
    /// Larger bodies are never stored
    pub max_body_bytes: usize,
}

/// Background maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between sweeps of expired in-memory state
    pub sweep_interval_seconds: u64,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub connection_limit: ConnectionLimitConfig,
    pub blacklist: BlacklistConfig,
    pub geo: GeoConfig,
    pub anomaly: AnomalyConfig,
    pub cache: CacheConfig,
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.nodes.is_empty()
            && u32::from(self.cluster.base_port) + u32::from(self.cluster.node_count)
                > u32::from(u16::MAX) + 1
        {
            return Err(format!(
                "cluster.base_port {} leaves no room for {} nodes",
                self.cluster.base_port, self.cluster.node_count
            ));
        }
        if self.cluster.backend_urls().is_empty() {
            return Err("no backend nodes configured".to_string());
        }
        if self.rate_limit.default_limit == 0 || self.rate_limit.window_seconds == 0 {
            return Err("rate limit and window must be non-zero".to_string());
        }
        if self.connection_limit.max_per_client == 0 {
            return Err("connection_limit.max_per_client must be non-zero".to_string());
        }
        if self.cluster.failure_threshold == 0 || self.cluster.recovery_threshold == 0 {
            return Err("health thresholds must be non-zero".to_string());
        }
        if self.anomaly.bucket_seconds == 0 || self.anomaly.tighten_factor == 0 {
            return Err("anomaly bucket and tighten factor must be non-zero".to_string());
        }
        if self.cluster.node_capacity == Some(0) {
            return Err("cluster.node_capacity must be non-zero when set".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                trust_forwarded_for: false,
            },
            cluster: ClusterConfig {
                nodes: Vec::new(),
                node_count: 3,
                base_port: 5000,
                node_host: "127.0.0.1".to_string(),
                algorithm: Algorithm::RoundRobin,
                sticky_sessions: false,
                sticky_ttl_seconds: 1800,
                session_cookie: "session".to_string(),
                node_capacity: None,
                connection_timeout_seconds: 30,
                max_retries: 0,
                health_check_interval: 10,
                health_check_timeout: 5,
                failure_threshold: 3,
                recovery_threshold: 2,
                initial_probe: true,
            },
            redis: RedisConfig {
                enabled: false,
                url: "redis://127.0.0.1:6379".to_string(),
            },
            rate_limit: RateLimitConfig {
                default_limit: 100,
                window_seconds: 60,
            },
            connection_limit: ConnectionLimitConfig {
                max_per_client: 20,
                lease_timeout_seconds: 30,
                slow_response_seconds: 15.0,
                slow_tracking_seconds: 3600,
            },
            blacklist: BlacklistConfig {
                violation_threshold: 5,
                duration_seconds: 3600,
                whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            },
            geo: GeoConfig {
                enabled: false,
                database_path: "GeoLite2-Country.mmdb".to_string(),
                blocked_countries: Vec::new(),
                allowed_countries: Vec::new(),
                fail_open: true,
            },
            anomaly: AnomalyConfig {
                enabled: true,
                bucket_seconds: 10,
                baseline_alpha: 0.2,
                min_baseline_buckets: 3,
                rate_multiplier: 3.0,
                error_multiplier: 3.0,
                client_window_seconds: 300,
                client_threshold: 0.8,
                action: AnomalyAction::LogOnly,
                tighten_factor: 2,
                tighten_seconds: 60,
            },
            cache: CacheConfig {
                enabled: true,
                default_ttl_seconds: 300,
                vary_headers: vec!["accept".to_string(), "accept-encoding".to_string()],
                max_body_bytes: 1024 * 1024,
            },
            maintenance: MaintenanceConfig {
                sweep_interval_seconds: 60,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_nodes_from_base_port() {
        let config = Config::default();
        assert_eq!(
            config.cluster.backend_urls(),
            vec![
                "http://127.0.0.1:5000",
                "http://127.0.0.1:5001",
                "http://127.0.0.1:5002",
            ]
        );
    }

    #[test]
    fn explicit_nodes_win() {
        let mut config = Config::default();
        config.cluster.nodes = vec!["http://10.0.0.1:80".to_string()];
        assert_eq!(config.cluster.backend_urls(), vec!["http://10.0.0.1:80"]);
    }

    #[test]
    fn derived_ports_must_fit() {
        let mut config = Config::default();
        config.cluster.base_port = 65534;
        config.cluster.node_count = 2;
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.backend_urls().len(), 2);

        config.cluster.node_count = 3;
        assert!(config.validate().unwrap_err().contains("base_port"));
        assert_eq!(config.cluster.backend_urls().len(), 2);
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.rate_limit.default_limit = 0;
        assert!(config.validate().is_err());
    }
}
