//! Periodic health checks of backend nodes.
//!
//! Each round probes every node's `/health` endpoint concurrently and feeds
//! the result into the node's hysteresis state machine. Transitions are
//! published through the registry; request handlers never wait on probes.

use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use crate::core::balancer::LoadBalancer;
use crate::core::registry::{Hysteresis, Node, NodeRegistry, NodeStatus, ProbeReport};
use crate::models::ClusterConfig;

/// Errors that can occur while probing a node
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("unhealthy status {0}")]
    BadStatus(u16),
}

/// Health monitor
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    balancer: Arc<LoadBalancer>,
    client: Client,
    interval: Duration,
    timeout: Duration,
    hysteresis: Hysteresis,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        balancer: Arc<LoadBalancer>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            client: Client::new(),
            interval: Duration::from_secs(config.health_check_interval.max(1)),
            timeout: Duration::from_secs(config.health_check_timeout.max(1)),
            hysteresis: Hysteresis {
                failure_threshold: config.failure_threshold,
                recovery_threshold: config.recovery_threshold,
            },
        }
    }

    /// Run the monitor on its own task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.start_monitoring().await })
    }

    /// Probe forever on the configured interval
    pub async fn start_monitoring(&self) {
        info!(
            "Starting health monitor: every {:?}, timeout {:?}",
            self.interval, self.timeout
        );
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let active = self.check_all().await;
            debug!("Health round completed, {} active nodes", active);
        }
    }

    /// Probe every node once; returns the number of active nodes afterwards
    pub async fn check_all(&self) -> usize {
        let nodes = self.registry.list_all();
        let before = self.registry.list_active().len();

        let results = join_all(nodes.iter().map(|node| self.probe(node))).await;
        for (node, result) in nodes.iter().zip(results) {
            self.apply(node, result);
        }

        let after = self.registry.list_active().len();
        metrics::gauge!("edge_active_nodes", after as f64);
        if before != after {
            info!("Cluster state updated: {} active nodes (was {})", after, before);
        }
        after
    }

    /// Startup round: each node's status is taken straight from its probe,
    /// without waiting for the hysteresis thresholds
    pub async fn initial_check(&self) -> usize {
        let nodes = self.registry.list_all();
        let results = join_all(nodes.iter().map(|node| self.probe(node))).await;
        for (node, result) in nodes.iter().zip(results) {
            let status = match result {
                Ok(report) => {
                    node.observe_probe(Some(report), self.hysteresis);
                    NodeStatus::Up
                }
                Err(e) => {
                    warn!("Initial health check failed for {}: {}", node.url(), e);
                    NodeStatus::Down
                }
            };
            self.registry.set_health(node.id(), status);
        }

        let active = self.registry.list_active().len();
        metrics::gauge!("edge_active_nodes", active as f64);
        active
    }

    async fn probe(&self, node: &Node) -> Result<ProbeReport, ProbeError> {
        let response = self
            .client
            .get(format!("{}/health", node.url()))
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProbeError::BadStatus(response.status().as_u16()));
        }
        // Any 2xx counts; the body is informational.
        Ok(response.json::<ProbeReport>().await.unwrap_or_default())
    }

    /// Feed one probe outcome into the node's state machine
    pub fn apply(&self, node: &Node, result: Result<ProbeReport, ProbeError>) {
        let report = match result {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Health check failed for {}: {}", node.url(), e);
                None
            }
        };

        match node.observe_probe(report, self.hysteresis) {
            Some(NodeStatus::Down) => {
                let evicted = self.balancer.evict_node(node.id());
                warn!(
                    "Node {} marked down after {} failed probes ({} sticky bindings dropped)",
                    node.url(),
                    self.hysteresis.failure_threshold,
                    evicted
                );
                metrics::increment_counter!("edge_node_transitions_total", "status" => "down");
            }
            Some(NodeStatus::Up) => {
                info!("Node {} is back up", node.url());
                metrics::increment_counter!("edge_node_transitions_total", "status" => "up");
            }
            None => {}
        }
    }
}
