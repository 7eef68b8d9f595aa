//! Node selection policies and sticky sessions.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use crate::core::error::ProxyError;
use crate::core::registry::{Node, NodeRegistry};
use crate::utils::stable_hash;

/// Load-balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[value(name = "round_robin")]
    RoundRobin,
    #[value(name = "least_connections")]
    LeastConnections,
    #[value(name = "ip_hash")]
    IpHash,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::IpHash => "ip_hash",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking, as far as routing is concerned
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub ip: IpAddr,
    /// Session token presented by the client
    pub session: Option<String>,
    /// Node id from a `SERVERID` cookie set on an earlier response
    pub server_hint: Option<String>,
}

impl ClientIdentity {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip,
            session: None,
            server_hint: None,
        }
    }

    /// Key of the client's sticky binding
    pub fn sticky_key(&self) -> String {
        match &self.session {
            Some(token) => format!("session:{}", token),
            None => format!("ip:{}", self.ip),
        }
    }
}

struct Binding {
    node_id: String,
    expires_at: Instant,
}

/// Client → node bindings with expiry
pub struct SessionTable {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    /// Bound node id, if the binding is still live
    pub fn lookup(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(binding) = self.bindings.get(key) {
            if now < binding.expires_at {
                return Some(binding.node_id.clone());
            }
        }
        self.bindings.remove_if(key, |_, b| now >= b.expires_at);
        None
    }

    pub fn bind(&self, key: String, node_id: &str) {
        self.bindings.insert(
            key,
            Binding {
                node_id: node_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn evict(&self, key: &str) {
        self.bindings.remove(key);
    }

    /// Drop every binding to `node_id`, returning how many were dropped
    pub fn evict_node(&self, node_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.node_id != node_id);
        before.saturating_sub(self.bindings.len())
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, b| now < b.expires_at);
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks a node for each request
pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    algorithm: Algorithm,
    cursor: AtomicUsize,
    sessions: Option<SessionTable>,
}

impl LoadBalancer {
    /// `sticky_ttl` enables sticky sessions when set
    pub fn new(registry: Arc<NodeRegistry>, algorithm: Algorithm, sticky_ttl: Option<Duration>) -> Self {
        Self {
            registry,
            algorithm,
            cursor: AtomicUsize::new(0),
            sessions: sticky_ttl.map(SessionTable::new),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sticky_sessions(&self) -> bool {
        self.sessions.is_some()
    }

    pub fn sessions(&self) -> Option<&SessionTable> {
        self.sessions.as_ref()
    }

    pub fn select(&self, client: &ClientIdentity) -> Result<Arc<Node>, ProxyError> {
        self.select_excluding(client, &[])
    }

    /// Select a node other than the ones in `tried`
    pub fn select_excluding(
        &self,
        client: &ClientIdentity,
        tried: &[String],
    ) -> Result<Arc<Node>, ProxyError> {
        let available: Vec<Arc<Node>> = self
            .registry
            .list_available()
            .into_iter()
            .filter(|n| !tried.iter().any(|id| id == n.id()))
            .collect();
        if available.is_empty() {
            return Err(ProxyError::NodeUnavailable);
        }

        if let Some(sessions) = &self.sessions {
            let key = client.sticky_key();
            if let Some(node_id) = sessions.lookup(&key) {
                if let Some(node) = available.iter().find(|n| n.id() == node_id) {
                    debug!("Sticky binding {} -> {}", key, node_id);
                    return Ok(Arc::clone(node));
                }
                sessions.evict(&key);
            }
            if let Some(hint) = &client.server_hint {
                if let Some(node) = available.iter().find(|n| n.id() == hint) {
                    return Ok(Arc::clone(node));
                }
            }
        }

        let node = match self.algorithm {
            Algorithm::RoundRobin => {
                let position = self.cursor.fetch_add(1, Ordering::Relaxed);
                &available[position % available.len()]
            }
            Algorithm::LeastConnections => available
                .iter()
                .min_by_key(|n| (n.connections(), n.index()))
                .unwrap_or(&available[0]),
            Algorithm::IpHash => {
                let hash = stable_hash(client.ip.to_string().as_bytes());
                &available[(hash % available.len() as u64) as usize]
            }
        };
        Ok(Arc::clone(node))
    }

    /// Pin the client to `node` after a successful dispatch
    pub fn bind(&self, client: &ClientIdentity, node: &Node) {
        if let Some(sessions) = &self.sessions {
            sessions.bind(client.sticky_key(), node.id());
        }
    }

    /// Forget bindings to a node that went down
    pub fn evict_node(&self, node_id: &str) -> usize {
        self.sessions.as_ref().map_or(0, |s| s.evict_node(node_id))
    }
}
