//! Registry of backend nodes and their live statistics.
//!
//! Counters are atomics so request handlers never contend on a lock;
//! health state sits behind a short per-node mutex shared with the
//! health monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

/// Node availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Up,
    Down,
}

#[derive(Debug)]
struct HealthState {
    status: NodeStatus,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    server_id: Option<String>,
    threads: Option<u64>,
}

/// Probe hysteresis thresholds
#[derive(Debug, Clone, Copy)]
pub struct Hysteresis {
    /// Consecutive failures that take an up node down
    pub failure_threshold: u32,
    /// Consecutive successes that bring a down node back
    pub recovery_threshold: u32,
}

/// Details reported by a node's `/health` endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub connections: Option<u64>,
    #[serde(default)]
    pub threads: Option<u64>,
}

/// A backend target
#[derive(Debug)]
pub struct Node {
    id: String,
    url: String,
    index: usize,
    connections: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    health: Mutex<HealthState>,
}

/// `http://127.0.0.1:5000` becomes `127.0.0.1_5000`
fn node_id(url: &str) -> String {
    url.trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .replace(':', "_")
}

impl Node {
    fn new(url: &str, index: usize) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self {
            id: node_id(&url),
            url,
            index,
            connections: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            health: Mutex::new(HealthState {
                status: NodeStatus::Up,
                last_check: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
                server_id: None,
                threads: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Registration order
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    fn health(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> NodeStatus {
        self.health().status
    }

    pub fn is_up(&self) -> bool {
        self.status() == NodeStatus::Up
    }

    fn has_capacity(&self, capacity: Option<u64>) -> bool {
        capacity.map_or(true, |cap| self.connections() < cap)
    }

    /// Count a connection unless the node is already at `capacity`.
    fn try_acquire(&self, capacity: Option<u64>) -> bool {
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match capacity {
                Some(cap) if current >= cap => None,
                _ => Some(current + 1),
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    /// Feed one probe result through the hysteresis state machine.
    /// Returns the new status when the node flipped.
    pub fn observe_probe(
        &self,
        report: Option<ProbeReport>,
        hysteresis: Hysteresis,
    ) -> Option<NodeStatus> {
        let mut health = self.health();
        health.last_check = Some(Utc::now());

        match report {
            Some(report) => {
                health.consecutive_failures = 0;
                health.consecutive_successes = health.consecutive_successes.saturating_add(1);
                if report.server_id.is_some() {
                    health.server_id = report.server_id;
                }
                if report.threads.is_some() {
                    health.threads = report.threads;
                }
                if health.status == NodeStatus::Down
                    && health.consecutive_successes >= hysteresis.recovery_threshold
                {
                    health.status = NodeStatus::Up;
                    return Some(NodeStatus::Up);
                }
            }
            None => {
                health.consecutive_successes = 0;
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.status == NodeStatus::Up
                    && health.consecutive_failures >= hysteresis.failure_threshold
                {
                    health.status = NodeStatus::Down;
                    return Some(NodeStatus::Down);
                }
            }
        }
        None
    }

    fn set_status(&self, status: NodeStatus) {
        let mut health = self.health();
        health.status = status;
        health.consecutive_failures = 0;
        health.consecutive_successes = 0;
    }

    pub fn stats(&self) -> NodeStats {
        let health = self.health();
        NodeStats {
            id: self.id.clone(),
            url: self.url.clone(),
            status: health.status,
            connections: self.connections(),
            requests: self.requests(),
            errors: self.errors(),
            server_id: health.server_id.clone(),
            threads: health.threads,
            last_check: health.last_check,
        }
    }
}

/// Serializable snapshot of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: String,
    pub url: String,
    pub status: NodeStatus,
    pub connections: u64,
    pub requests: u64,
    pub errors: u64,
    pub server_id: Option<String>,
    pub threads: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
}

/// A forwarded request in flight on a node.
///
/// Dropping the lease releases the connection slot, so a cancelled request
/// frees its slot without being counted as an error.
#[derive(Debug)]
pub struct NodeLease {
    node: Arc<Node>,
}

impl NodeLease {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Record the outcome of the forwarded request and release the slot
    pub fn finish(self, success: bool) {
        self.node.requests.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.node.errors.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.node.release();
    }
}

/// The set of backend nodes, fixed at startup
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<Arc<Node>>,
    capacity: Option<u64>,
}

impl NodeRegistry {
    pub fn new<S: AsRef<str>>(urls: &[S], capacity: Option<u64>) -> Self {
        let nodes = urls
            .iter()
            .enumerate()
            .map(|(index, url)| Arc::new(Node::new(url.as_ref(), index)))
            .collect();
        Self {
            nodes,
            capacity,
        }
    }

    /// Every registered node, in registration order
    pub fn list_all(&self) -> Vec<Arc<Node>> {
        self.nodes.clone()
    }

    /// Nodes currently up, in registration order
    pub fn list_active(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().filter(|n| n.is_up()).cloned().collect()
    }

    /// Nodes that are up and below capacity, in registration order
    pub fn list_available(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| n.is_up() && n.has_capacity(self.capacity))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Take a connection slot on `node`. `None` when it filled up since
    /// it was selected.
    pub fn record_start(&self, node: &Arc<Node>) -> Option<NodeLease> {
        if node.try_acquire(self.capacity) {
            Some(NodeLease { node: Arc::clone(node) })
        } else {
            None
        }
    }

    /// Force a node's status, clearing its probe streaks
    pub fn set_health(&self, id: &str, status: NodeStatus) -> bool {
        match self.get(id) {
            Some(node) => {
                node.set_status(status);
                info!("Node {} marked {:?}", id, status);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<NodeStats> {
        self.nodes.iter().map(|n| n.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYSTERESIS: Hysteresis = Hysteresis {
        failure_threshold: 3,
        recovery_threshold: 2,
    };

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            &["http://127.0.0.1:5000", "http://127.0.0.1:5001", "http://127.0.0.1:5002"],
            None,
        )
    }

    #[test]
    fn ids_and_order_follow_registration() {
        let registry = registry();
        let ids: Vec<_> = registry.list_active().iter().map(|n| n.id().to_string()).collect();
        assert_eq!(ids, vec!["127.0.0.1_5000", "127.0.0.1_5001", "127.0.0.1_5002"]);
    }

    #[test]
    fn down_nodes_are_not_active() {
        let registry = registry();
        assert!(registry.set_health("127.0.0.1_5001", NodeStatus::Down));
        let active: Vec<_> = registry.list_active().iter().map(|n| n.index()).collect();
        assert_eq!(active, vec![0, 2]);

        for node in registry.list_all() {
            registry.set_health(node.id(), NodeStatus::Down);
        }
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn lease_counts_and_releases() {
        let registry = registry();
        let node = registry.list_active()[0].clone();

        let ok = registry.record_start(&node).unwrap();
        let failed = registry.record_start(&node).unwrap();
        assert_eq!(node.connections(), 2);

        ok.finish(true);
        failed.finish(false);
        assert_eq!(node.connections(), 0);
        assert_eq!(node.requests(), 2);
        assert_eq!(node.errors(), 1);

        // a dropped lease (cancelled request) only frees the slot
        drop(registry.record_start(&node).unwrap());
        assert_eq!(node.connections(), 0);
        assert_eq!(node.requests(), 2);
    }

    #[test]
    fn capacity_excludes_full_nodes() {
        let registry = NodeRegistry::new(&["http://a:1", "http://b:2"], Some(1));
        let first = registry.list_available()[0].clone();
        let lease = registry.record_start(&first).unwrap();

        assert!(registry.record_start(&first).is_none());
        let available: Vec<_> = registry.list_available().iter().map(|n| n.index()).collect();
        assert_eq!(available, vec![1]);

        drop(lease);
        assert_eq!(registry.list_available().len(), 2);
    }

    #[test]
    fn concurrent_leases_lose_no_updates() {
        let registry = Arc::new(registry());
        let node = registry.list_active()[0].clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let node = Arc::clone(&node);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.record_start(&node).unwrap().finish(true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(node.requests(), 8000);
        assert_eq!(node.connections(), 0);
    }

    #[test]
    fn hysteresis_three_failures_down_two_successes_up() {
        let registry = registry();
        let node = registry.list_all()[1].clone();

        assert_eq!(node.observe_probe(None, HYSTERESIS), None);
        assert_eq!(node.observe_probe(None, HYSTERESIS), None);
        assert!(node.is_up());
        assert_eq!(node.observe_probe(None, HYSTERESIS), Some(NodeStatus::Down));
        assert_eq!(registry.list_active().len(), 2);

        let report = ProbeReport::default();
        assert_eq!(node.observe_probe(Some(report.clone()), HYSTERESIS), None);
        assert_eq!(node.observe_probe(Some(report), HYSTERESIS), Some(NodeStatus::Up));
        assert_eq!(registry.list_active().len(), 3);
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let registry = registry();
        let node = registry.list_all()[0].clone();

        node.observe_probe(None, HYSTERESIS);
        node.observe_probe(None, HYSTERESIS);
        node.observe_probe(Some(ProbeReport::default()), HYSTERESIS);
        node.observe_probe(None, HYSTERESIS);
        node.observe_probe(None, HYSTERESIS);
        assert!(node.is_up());
    }

    #[test]
    fn probe_report_details_are_kept() {
        let registry = registry();
        let node = registry.list_all()[0].clone();
        let report = ProbeReport {
            status: Some("healthy".to_string()),
            server_id: Some("node-a".to_string()),
            connections: Some(4),
            threads: Some(16),
        };
        node.observe_probe(Some(report), HYSTERESIS);

        let stats = node.stats();
        assert_eq!(stats.server_id.as_deref(), Some("node-a"));
        assert_eq!(stats.threads, Some(16));
        assert!(stats.last_check.is_some());
    }
}
