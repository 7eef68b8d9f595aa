//! Policy chain run in front of every proxied request.
//!
//! Stages run in a fixed order: whitelist, blacklist, geo, rate limit,
//! connection limit, anomaly, cache. A stage either lets the request
//! continue, answers it (cache hit), or rejects it with a [`ProxyError`].
//! Whitelisted clients skip every protective stage.

use std::sync::Arc;
use actix_web::http::header::HeaderMap;
use async_trait::async_trait;
use log::{error, warn};
use crate::core::anomaly::{AnomalyAction, AnomalyDetector, AnomalyScope};
use crate::core::balancer::ClientIdentity;
use crate::core::blacklist::Blacklist;
use crate::core::cache::{CachedResponse, ResponseCache};
use crate::core::connection_limiter::{ConnectionLease, ConnectionLimitError, ConnectionLimiter};
use crate::core::error::ProxyError;
use crate::core::geo::GeoFilter;
use crate::core::rate_limiter::{RateLimitError, RateLimiter};

/// Everything the stages know about a request
pub struct RequestContext {
    pub client: ClientIdentity,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub whitelisted: bool,
    pub cache_key: Option<String>,
    /// Client connection slot, held until the response is sent
    pub lease: Option<ConnectionLease>,
}

impl RequestContext {
    pub fn new(
        client: ClientIdentity,
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            client,
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            whitelisted: false,
            cache_key: None,
            lease: None,
        }
    }

    /// Slow clients announce themselves through `X-SlowTest` or their user agent
    pub fn is_slow_client(&self) -> bool {
        self.headers.contains_key("x-slowtest")
            || self
                .headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map_or(false, |ua| ua.to_ascii_lowercase().contains("slow"))
    }

    pub async fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    Continue,
    Respond(CachedResponse),
}

/// One policy step
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Protective stages are skipped for whitelisted clients
    fn protective(&self) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError>;
}

pub struct WhitelistStage {
    blacklist: Arc<Blacklist>,
}

#[async_trait]
impl Stage for WhitelistStage {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    fn protective(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        ctx.whitelisted = self.blacklist.is_whitelisted(&ctx.client.ip);
        Ok(Verdict::Continue)
    }
}

pub struct BlacklistStage {
    blacklist: Arc<Blacklist>,
}

#[async_trait]
impl Stage for BlacklistStage {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        match self.blacklist.is_blacklisted(&ctx.client.ip).await {
            Ok(true) => Err(ProxyError::Blacklisted),
            Ok(false) => Ok(Verdict::Continue),
            Err(e) => {
                error!("Blacklist lookup failed for {}: {}", ctx.client.ip, e);
                Ok(Verdict::Continue)
            }
        }
    }
}

pub struct GeoStage {
    geo: GeoFilter,
}

#[async_trait]
impl Stage for GeoStage {
    fn name(&self) -> &'static str {
        "geo"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        self.geo.check(&ctx.client.ip)?;
        Ok(Verdict::Continue)
    }
}

pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    anomaly: Arc<AnomalyDetector>,
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        let ip = ctx.client.ip;
        let limit = self.anomaly.effective_limit(&ip, self.limiter.default_limit());
        match self.limiter.check_with_limit(&ip.to_string(), limit).await {
            Ok(_) => Ok(Verdict::Continue),
            Err(RateLimitError::ExceededLimit { count, limit }) => {
                warn!("Rate limit exceeded for IP: {} ({} > {})", ip, count, limit);
                Err(ProxyError::RateLimited)
            }
            Err(RateLimitError::StoreError(e)) => {
                error!("Rate limit check failed for {}: {}", ip, e);
                Ok(Verdict::Continue)
            }
        }
    }
}

pub struct ConnectionLimitStage {
    limiter: Arc<ConnectionLimiter>,
}

#[async_trait]
impl Stage for ConnectionLimitStage {
    fn name(&self) -> &'static str {
        "connection_limit"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        let client = ctx.client.ip.to_string();
        match self.limiter.acquire(&client, ctx.is_slow_client()).await {
            Ok(lease) => {
                ctx.lease = Some(lease);
                Ok(Verdict::Continue)
            }
            Err(ConnectionLimitError::Capped { count, cap }) => {
                warn!("Too many connections from IP: {} ({} > {})", client, count, cap);
                Err(ProxyError::ConnectionCapped)
            }
            Err(ConnectionLimitError::StoreError(e)) => {
                error!("Connection limit check failed for {}: {}", client, e);
                Ok(Verdict::Continue)
            }
        }
    }
}

pub struct AnomalyStage {
    detector: Arc<AnomalyDetector>,
    blacklist: Arc<Blacklist>,
}

#[async_trait]
impl Stage for AnomalyStage {
    fn name(&self) -> &'static str {
        "anomaly"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        let ip = ctx.client.ip;
        let scope = match self.detector.observe_request(&ip) {
            Some(scope) => scope,
            None => return Ok(Verdict::Continue),
        };

        match (self.detector.action(), scope) {
            (AnomalyAction::LogOnly, _) => {
                warn!("Anomalous traffic ({:?}) observed at IP: {}", scope, ip);
            }
            (AnomalyAction::Tighten, _) => {
                warn!("Tightening rate limit after {:?} anomaly at IP: {}", scope, ip);
                self.detector.tighten(scope, &ip);
            }
            (AnomalyAction::Blacklist, AnomalyScope::Client) => {
                if let Err(e) = self.blacklist.record_violation(&ip).await {
                    error!("Failed to record violation for {}: {}", ip, e);
                }
            }
            (AnomalyAction::Blacklist, AnomalyScope::Global) => {
                warn!("Global traffic anomaly, no single client to penalize");
            }
        }
        Ok(Verdict::Continue)
    }
}

pub struct CacheStage {
    cache: Arc<ResponseCache>,
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn protective(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        ctx.cache_key = self
            .cache
            .cache_key(&ctx.method, &ctx.path, &ctx.query, &ctx.headers);
        let key = match &ctx.cache_key {
            Some(key) => key,
            None => return Ok(Verdict::Continue),
        };
        Ok(match self.cache.lookup(key).await {
            Some(hit) => Verdict::Respond(hit),
            None => Verdict::Continue,
        })
    }
}

/// The ordered stages plus violation bookkeeping for their rejections
pub struct MiddlewareChain {
    stages: Vec<Box<dyn Stage>>,
    blacklist: Arc<Blacklist>,
}

impl MiddlewareChain {
    pub fn new(blacklist: Arc<Blacklist>) -> Self {
        Self {
            stages: Vec::new(),
            blacklist,
        }
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Standard chain in its fixed order
    pub fn standard(
        blacklist: Arc<Blacklist>,
        geo: GeoFilter,
        rate_limiter: Arc<RateLimiter>,
        connection_limiter: Arc<ConnectionLimiter>,
        anomaly: Arc<AnomalyDetector>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let mut chain = Self::new(Arc::clone(&blacklist))
            .with_stage(WhitelistStage {
                blacklist: Arc::clone(&blacklist),
            })
            .with_stage(BlacklistStage {
                blacklist: Arc::clone(&blacklist),
            });
        if geo.enabled() {
            chain = chain.with_stage(GeoStage { geo });
        }
        chain = chain
            .with_stage(RateLimitStage {
                limiter: rate_limiter,
                anomaly: Arc::clone(&anomaly),
            })
            .with_stage(ConnectionLimitStage {
                limiter: connection_limiter,
            });
        if anomaly.enabled() {
            chain = chain.with_stage(AnomalyStage {
                detector: anomaly,
                blacklist,
            });
        }
        if cache.enabled() {
            chain = chain.with_stage(CacheStage { cache });
        }
        chain
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage. Rejections that the client caused are counted as
    /// violations, which may blacklist it.
    pub async fn run(&self, ctx: &mut RequestContext) -> Result<Verdict, ProxyError> {
        for stage in &self.stages {
            if ctx.whitelisted && stage.protective() {
                continue;
            }
            match stage.evaluate(ctx).await {
                Ok(Verdict::Continue) => {}
                Ok(verdict) => return Ok(verdict),
                Err(e) => {
                    metrics::increment_counter!("edge_rejections_total", "kind" => e.kind());
                    if e.is_violation() {
                        match self.blacklist.record_violation(&ctx.client.ip).await {
                            Ok(outcome) if outcome.blacklisted => {
                                warn!("IP {} blacklisted after {} violations", ctx.client.ip, outcome.violations)
                            }
                            Ok(_) => {}
                            Err(err) => error!("Failed to record violation for {}: {}", ctx.client.ip, err),
                        }
                    }
                    ctx.release().await;
                    return Err(e);
                }
            }
        }
        Ok(Verdict::Continue)
    }
}
