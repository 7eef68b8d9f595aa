//! Core functionality of the edge proxy.
//!
//! This module contains the node registry, health monitoring and load
//! balancing for the backend cluster, the protective layers (rate and
//! connection limiting, blacklist, geo filter, anomaly detection), the
//! response cache and the proxy front that ties them together.

pub mod store;
pub mod error;
pub mod registry;
pub mod health;
pub mod balancer;
pub mod rate_limiter;
pub mod connection_limiter;
pub mod blacklist;
pub mod geo;
pub mod anomaly;
pub mod cache;
pub mod middleware;
pub mod proxy;

#[cfg(test)]
pub mod test_support;

pub use store::{FallbackStore, KvStore, MemoryStore, RedisStore, StoreError};
pub use error::ProxyError;
pub use registry::{Node, NodeRegistry, NodeStatus};
pub use health::HealthMonitor;
pub use balancer::{Algorithm, LoadBalancer};
pub use rate_limiter::RateLimiter;
pub use connection_limiter::ConnectionLimiter;
pub use blacklist::Blacklist;
pub use geo::GeoFilter;
pub use anomaly::AnomalyDetector;
pub use cache::ResponseCache;
pub use middleware::MiddlewareChain;
pub use proxy::ProxyState;
