//! Proxy front: runs the policy chain, picks a node and forwards the request.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{HttpRequest, HttpResponse};
use log::{debug, error, info, warn};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;
use crate::core::anomaly::{AnomalyDetector, AnomalySnapshot};
use crate::core::balancer::{Algorithm, ClientIdentity, LoadBalancer};
use crate::core::blacklist::Blacklist;
use crate::core::cache::{CachedResponse, ResponseCache};
use crate::core::connection_limiter::ConnectionLimiter;
use crate::core::error::ProxyError;
use crate::core::geo::GeoFilter;
use crate::core::health::HealthMonitor;
use crate::core::middleware::{MiddlewareChain, RequestContext, Verdict};
use crate::core::rate_limiter::RateLimiter;
use crate::core::registry::{Node, NodeRegistry, NodeStats};
use crate::core::store::{FallbackStore, KvStore, StoreError};
use crate::models::{Config, ConnectionLimitConfig, RateLimitConfig};

/// Cookie naming the node that served the client
pub const SERVER_COOKIE: &str = "SERVERID";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const SLOW_REQUEST_HEADER: &str = "x-slow-request-detected";

const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-XSS-Protection", "1; mode=block"),
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

struct UpstreamResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

fn upstream_error(node: &Node, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout(node.id().to_string())
    } else {
        ProxyError::UpstreamError {
            node: node.id().to_string(),
            reason: e.to_string(),
        }
    }
}

/// Protection settings and live state reported by `/proxy/status`
#[derive(Debug, Serialize)]
pub struct ProtectionStatus {
    pub store: &'static str,
    pub rate_limit: RateLimitConfig,
    pub connection_limit: ConnectionLimitConfig,
    pub violation_threshold: u32,
    pub blacklist_seconds: u64,
    pub whitelist: Vec<String>,
    pub geo_enabled: bool,
    pub cache_enabled: bool,
    pub sticky_bindings: usize,
    pub anomaly: AnomalySnapshot,
}

#[derive(Debug, Serialize)]
pub struct ProxyStatus {
    pub proxy_id: String,
    /// URLs of the nodes taking traffic, in registration order
    pub active_nodes: Vec<String>,
    pub active_node_count: usize,
    /// Keyed by node URL
    pub node_stats: BTreeMap<String, NodeStats>,
    pub algorithm: Algorithm,
    pub sticky_sessions: bool,
    /// Seconds since start
    pub uptime: f64,
    pub protection: ProtectionStatus,
}

/// Shared state of the proxy, one per process
pub struct ProxyState {
    pub config: Arc<Config>,
    pub proxy_id: String,
    pub registry: Arc<NodeRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub blacklist: Arc<Blacklist>,
    pub metrics: Option<PrometheusHandle>,
    chain: MiddlewareChain,
    rate_limiter: Arc<RateLimiter>,
    connections: Arc<ConnectionLimiter>,
    cache: Arc<ResponseCache>,
    anomaly: Arc<AnomalyDetector>,
    store: Arc<FallbackStore>,
    client: reqwest::Client,
    started: Instant,
}

impl ProxyState {
    pub fn new(config: Config, store: Arc<FallbackStore>, geo: GeoFilter) -> Result<Self, reqwest::Error> {
        let shared: Arc<dyn KvStore> = store.clone();
        let urls = config.cluster.backend_urls();
        let registry = Arc::new(NodeRegistry::new(urls.as_slice(), config.cluster.node_capacity));
        let sticky_ttl = config
            .cluster
            .sticky_sessions
            .then(|| Duration::from_secs(config.cluster.sticky_ttl_seconds));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            config.cluster.algorithm,
            sticky_ttl,
        ));

        let blacklist = Arc::new(Blacklist::new(Arc::clone(&shared), config.blacklist.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(config.anomaly.clone(), &config.rate_limit));
        let cache = Arc::new(ResponseCache::new(Arc::clone(&shared), config.cache.clone()));
        let connections = Arc::new(ConnectionLimiter::new(
            Arc::clone(&shared),
            config.connection_limit.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&shared), config.rate_limit.clone()));
        let chain = MiddlewareChain::standard(
            Arc::clone(&blacklist),
            geo,
            Arc::clone(&rate_limiter),
            Arc::clone(&connections),
            Arc::clone(&anomaly),
            Arc::clone(&cache),
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.cluster.connection_timeout_seconds.max(1)))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let proxy_id: String = Uuid::new_v4().to_string().chars().take(8).collect();
        info!(
            "Proxy {} balancing {} nodes with {}",
            proxy_id,
            urls.len(),
            config.cluster.algorithm
        );

        Ok(Self {
            config: Arc::new(config),
            proxy_id,
            registry,
            balancer,
            blacklist,
            metrics: None,
            chain,
            rate_limiter,
            connections,
            cache,
            anomaly,
            store,
            client,
            started: Instant::now(),
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.balancer),
            &self.config.cluster,
        )
    }

    /// Client address: the peer, or the first `X-Forwarded-For` hop when trusted
    pub fn client_ip(&self, req: &HttpRequest) -> IpAddr {
        if self.config.server.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|hop| hop.trim().parse().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        req.peer_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    fn identify(&self, req: &HttpRequest) -> ClientIdentity {
        ClientIdentity {
            ip: self.client_ip(req),
            session: req
                .cookie(&self.config.cluster.session_cookie)
                .map(|c| c.value().to_string()),
            server_hint: req.cookie(SERVER_COOKIE).map(|c| c.value().to_string()),
        }
    }

    /// Handle one client request end to end
    pub async fn handle(&self, req: &HttpRequest, body: Bytes) -> Result<HttpResponse, ProxyError> {
        metrics::increment_counter!("edge_requests_total");
        let started = Instant::now();
        let mut ctx = RequestContext::new(
            self.identify(req),
            req.method().as_str(),
            req.path(),
            req.query_string(),
            req.headers().clone(),
        );

        let mut result = match self.chain.run(&mut ctx).await? {
            Verdict::Respond(hit) => {
                debug!("Cache hit for {}", ctx.path);
                Ok(self.cached_response(hit))
            }
            Verdict::Continue => self.dispatch(req, &ctx, body).await,
        };
        ctx.release().await;

        if let Ok(response) = result.as_mut() {
            self.flag_slow_response(&ctx, started.elapsed(), response).await;
        }
        result
    }

    /// Tag and count responses that took long enough to look like a
    /// Slowloris attempt
    async fn flag_slow_response(&self, ctx: &RequestContext, elapsed: Duration, response: &mut HttpResponse) {
        if ctx.whitelisted || !self.connections.is_slow_response(elapsed) {
            return;
        }
        response.headers_mut().insert(
            HeaderName::from_static(SLOW_REQUEST_HEADER),
            HeaderValue::from_static("true"),
        );
        let client = ctx.client.ip.to_string();
        if let Err(e) = self.connections.record_slow_response(&client, elapsed).await {
            error!("Failed to record slow response for {}: {}", client, e);
        }
    }

    async fn dispatch(
        &self,
        req: &HttpRequest,
        ctx: &RequestContext,
        body: Bytes,
    ) -> Result<HttpResponse, ProxyError> {
        let attempts = self.config.cluster.max_retries + 1;
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = ProxyError::NodeUnavailable;

        for attempt in 1..=attempts {
            let node = match self.balancer.select_excluding(&ctx.client, &tried) {
                Ok(node) => node,
                Err(e) if tried.is_empty() => {
                    warn!("No backend available for {}", ctx.client.ip);
                    return Err(e);
                }
                Err(_) => break,
            };
            tried.push(node.id().to_string());

            let lease = match self.registry.record_start(&node) {
                Some(lease) => lease,
                None => {
                    debug!("Node {} reached capacity", node.id());
                    continue;
                }
            };

            match self.forward(req, ctx, &node, body.clone()).await {
                Ok(upstream) => {
                    lease.finish(true);
                    self.anomaly.observe_outcome(upstream.status >= 500);
                    self.balancer.bind(&ctx.client, &node);

                    let cache_state = match &ctx.cache_key {
                        Some(key) => {
                            self.cache
                                .store(key, upstream.status, upstream.headers.clone(), &upstream.body)
                                .await;
                            Some("MISS")
                        }
                        None => None,
                    };
                    return Ok(self.respond(
                        upstream.status,
                        &upstream.headers,
                        upstream.body,
                        Some(&node),
                        cache_state,
                    ));
                }
                Err(e) => {
                    lease.finish(false);
                    self.anomaly.observe_outcome(true);
                    metrics::increment_counter!("edge_upstream_errors_total", "kind" => e.kind());
                    error!(
                        "Forwarding to {} failed (attempt {}/{}): {}",
                        node.url(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn forward(
        &self,
        req: &HttpRequest,
        ctx: &RequestContext,
        node: &Node,
        body: Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let mut url = format!("{}{}", node.url().trim_end_matches('/'), ctx.path);
        if !ctx.query.is_empty() {
            url.push('?');
            url.push_str(&ctx.query);
        }
        let method = reqwest::Method::from_bytes(ctx.method.as_bytes()).map_err(|e| {
            ProxyError::UpstreamError {
                node: node.id().to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in ctx.headers.iter() {
            let name = name.as_str();
            if is_hop_by_hop(name) || name == "host" || name == "x-forwarded-for" {
                continue;
            }
            builder = builder.header(name, value.as_bytes());
        }

        let prior = ctx
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .filter(|_| self.config.server.trust_forwarded_for);
        let forwarded_for = match (prior, req.peer_addr()) {
            (Some(prior), Some(peer)) => format!("{}, {}", prior, peer.ip()),
            (Some(prior), None) => prior.to_string(),
            (None, _) => ctx.client.ip.to_string(),
        };
        let (host, scheme) = {
            let info = req.connection_info();
            (info.host().to_string(), info.scheme().to_string())
        };
        builder = builder
            .header("X-Forwarded-For", forwarded_for)
            .header("X-Forwarded-Host", host)
            .header("X-Forwarded-Proto", scheme)
            .header("X-Proxy-ID", self.proxy_id.as_str());

        let started = Instant::now();
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| upstream_error(node, e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| upstream_error(node, e))?;
        metrics::histogram!(
            "edge_upstream_seconds",
            started.elapsed().as_secs_f64(),
            "node" => node.id().to_string()
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    fn cached_response(&self, hit: CachedResponse) -> HttpResponse {
        let CachedResponse {
            status,
            headers,
            body,
            ..
        } = hit;
        self.respond(status, &headers, Bytes::from(body), None, Some("HIT"))
    }

    fn respond(
        &self,
        status: u16,
        headers: &[(String, String)],
        body: Bytes,
        node: Option<&Node>,
        cache_state: Option<&'static str>,
    ) -> HttpResponse {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = HttpResponse::build(status);
        for (name, value) in headers {
            builder.append_header((name.as_str(), value.as_str()));
        }
        for header in SECURITY_HEADERS {
            builder.insert_header(header);
        }
        builder.insert_header(("X-Proxy-ID", self.proxy_id.as_str()));
        if let Some(state) = cache_state {
            builder.insert_header(("X-Cache", state));
        }
        if let Some(node) = node {
            if self.balancer.sticky_sessions() && status.as_u16() < 400 {
                builder.append_header((
                    "Set-Cookie",
                    format!("{}={}; Path=/; HttpOnly", SERVER_COOKIE, node.id()),
                ));
            }
        }
        builder.body(body)
    }

    /// Lift a blacklist entry and give the client a fresh rate window
    pub async fn pardon(&self, ip: &IpAddr) -> Result<(), StoreError> {
        self.blacklist.remove(ip).await?;
        if let Err(e) = self.rate_limiter.reset_rate_limit(&ip.to_string()).await {
            warn!("Failed to reset rate limit for {}: {}", ip, e);
        }
        Ok(())
    }

    pub fn status_report(&self) -> ProxyStatus {
        let node_stats = self
            .registry
            .snapshot()
            .into_iter()
            .map(|stats| (stats.url.clone(), stats))
            .collect();
        let active_nodes: Vec<String> = self
            .registry
            .list_active()
            .iter()
            .map(|node| node.url().to_string())
            .collect();
        ProxyStatus {
            proxy_id: self.proxy_id.clone(),
            active_node_count: active_nodes.len(),
            active_nodes,
            node_stats,
            algorithm: self.balancer.algorithm(),
            sticky_sessions: self.balancer.sticky_sessions(),
            uptime: self.started.elapsed().as_secs_f64(),
            protection: ProtectionStatus {
                store: self.store.backend(),
                rate_limit: self.config.rate_limit.clone(),
                connection_limit: self.config.connection_limit.clone(),
                violation_threshold: self.blacklist.violation_threshold(),
                blacklist_seconds: self.blacklist.default_duration().as_secs(),
                whitelist: self.config.blacklist.whitelist.clone(),
                geo_enabled: self.config.geo.enabled,
                cache_enabled: self.cache.enabled(),
                sticky_bindings: self.balancer.sessions().map_or(0, |s| s.len()),
                anomaly: self.anomaly.snapshot(),
            },
        }
    }

    /// Reclaim expired in-memory state
    pub fn sweep(&self) {
        let removed = self.store.sweep();
        let sessions = self.balancer.sessions().map_or(0, |s| s.purge_expired());
        self.anomaly.purge();
        if removed + sessions > 0 {
            debug!("Maintenance removed {} entries and {} sticky bindings", removed, sessions);
        }
    }

    /// Run [`ProxyState::sweep`] on the configured interval
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.maintenance.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep();
            }
        })
    }
}
