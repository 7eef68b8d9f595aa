//! Response cache keyed on normalized requests.

use std::sync::Arc;
use std::time::Duration;
use actix_web::http::header::HeaderMap;
use actix_web::web::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::core::store::KvStore;
use crate::models::CacheConfig;
use crate::utils::get_current_timestamp;

const CACHEABLE_STATUS: [u16; 5] = [200, 203, 301, 404, 410];

/// A stored upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Unix seconds
    pub expires_at: u64,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Lowercased `Cache-Control` directives
fn directives(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn max_age(directives: &[String]) -> Option<u64> {
    directives
        .iter()
        .find_map(|d| d.strip_prefix("max-age=").and_then(|v| v.trim().parse().ok()))
}

/// Collapse repeated slashes and drop a trailing one
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Key for a request, `None` when the request must bypass the cache
    pub fn cache_key(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &HeaderMap,
    ) -> Option<String> {
        if !self.config.enabled || !(method == "GET" || method == "HEAD") {
            return None;
        }
        if headers.contains_key("authorization") {
            return None;
        }
        let request_directives = directives(
            headers
                .get("cache-control")
                .and_then(|v| v.to_str().ok()),
        );
        if request_directives
            .iter()
            .any(|d| d == "no-cache" || d == "no-store")
        {
            return None;
        }

        let vary: Vec<String> = self
            .config
            .vary_headers
            .iter()
            .map(|name| {
                headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        Some(format!(
            "cache:{}:{}?{}|{}",
            method,
            normalize_path(path),
            sorted_query(query),
            vary.join("|")
        ))
    }

    /// TTL for a response, `None` when it may not be stored
    pub fn ttl_for(&self, status: u16, headers: &[(String, String)], body_len: usize) -> Option<Duration> {
        if !CACHEABLE_STATUS.contains(&status) || body_len > self.config.max_body_bytes {
            return None;
        }
        if headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("set-cookie")) {
            return None;
        }
        let cache_control = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
            .map(|(_, v)| v.as_str());
        let directives = directives(cache_control);
        if directives
            .iter()
            .any(|d| d == "no-store" || d == "private" || d == "no-cache")
        {
            return None;
        }

        let ttl = max_age(&directives)
            .map_or(self.config.default_ttl_seconds, |age| {
                age.min(self.config.default_ttl_seconds)
            });
        (ttl > 0).then(|| Duration::from_secs(ttl))
    }

    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::increment_counter!("edge_cache_misses_total");
                return None;
            }
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<CachedResponse>(&raw) {
            Ok(entry) if entry.is_fresh(get_current_timestamp()) => {
                metrics::increment_counter!("edge_cache_hits_total");
                Some(entry)
            }
            Ok(_) => {
                self.evict(key).await;
                metrics::increment_counter!("edge_cache_misses_total");
                None
            }
            Err(e) => {
                warn!("Dropping unreadable cache entry {}: {}", key, e);
                self.evict(key).await;
                None
            }
        }
    }

    async fn evict(&self, key: &str) {
        if let Err(e) = self.store.del(key).await {
            debug!("Failed to evict cache entry {}: {}", key, e);
        }
    }

    /// Store a response if its status and headers allow it. Returns whether
    /// it was stored.
    pub async fn store(
        &self,
        key: &str,
        status: u16,
        headers: Vec<(String, String)>,
        body: &Bytes,
    ) -> bool {
        let ttl = match self.ttl_for(status, &headers, body.len()) {
            Some(ttl) => ttl,
            None => return false,
        };
        let entry = CachedResponse {
            status,
            headers,
            body: body.to_vec(),
            expires_at: get_current_timestamp() + ttl.as_secs(),
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", key, e);
                return false;
            }
        };
        match self.store.set_ex(key, &encoded, ttl).await {
            Ok(()) => {
                debug!("Cached {} for {}s", key, ttl.as_secs());
                true
            }
            Err(e) => {
                warn!("Failed to store cache entry {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn cache() -> ResponseCache {
        ResponseCache::new(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                enabled: true,
                default_ttl_seconds: 300,
                vary_headers: vec!["accept-encoding".to_string()],
                max_body_bytes: 1024,
            },
        )
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        map
    }

    fn owned(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn keys_normalize_path_and_query() {
        let cache = cache();
        let none = HeaderMap::new();
        assert_eq!(
            cache.cache_key("GET", "//api//items/", "b=2&a=1", &none),
            cache.cache_key("GET", "/api/items", "a=1&b=2", &none)
        );
        assert_eq!(
            cache.cache_key("GET", "/api/items", "a=1", &none).as_deref(),
            Some("cache:GET:/api/items?a=1|")
        );
        assert_ne!(
            cache.cache_key("GET", "/x", "", &headers(&[("accept-encoding", "gzip")])),
            cache.cache_key("GET", "/x", "", &none)
        );
    }

    #[test]
    fn uncacheable_requests_have_no_key() {
        let cache = cache();
        assert!(cache.cache_key("POST", "/x", "", &HeaderMap::new()).is_none());
        assert!(cache
            .cache_key("GET", "/x", "", &headers(&[("authorization", "Bearer t")]))
            .is_none());
        assert!(cache
            .cache_key("GET", "/x", "", &headers(&[("cache-control", "no-cache")]))
            .is_none());
    }

    #[test]
    fn ttl_rules() {
        let cache = cache();
        assert_eq!(cache.ttl_for(200, &[], 10), Some(Duration::from_secs(300)));
        assert_eq!(
            cache.ttl_for(200, &owned(&[("Cache-Control", "public, max-age=60")]), 10),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            cache.ttl_for(404, &owned(&[("cache-control", "max-age=86400")]), 10),
            Some(Duration::from_secs(300))
        );
        assert_eq!(cache.ttl_for(500, &[], 10), None);
        assert_eq!(cache.ttl_for(200, &[], 4096), None);
        assert_eq!(cache.ttl_for(200, &owned(&[("cache-control", "private")]), 10), None);
        assert_eq!(cache.ttl_for(200, &owned(&[("Set-Cookie", "a=b")]), 10), None);
        assert_eq!(cache.ttl_for(200, &owned(&[("cache-control", "max-age=0")]), 10), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache();
        let key = "cache:GET:/a?|";
        let body = Bytes::from_static(b"hello");
        assert!(cache.lookup(key).await.is_none());

        assert!(
            cache
                .store(key, 200, owned(&[("cache-control", "max-age=60")]), &body)
                .await
        );
        let hit = cache.lookup(key).await.unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, b"hello");
        assert_eq!(hit.headers, owned(&[("cache-control", "max-age=60")]));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup(key).await.is_none());
    }

    #[tokio::test]
    async fn stale_embedded_expiry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), cache().config);
        let stale = CachedResponse {
            status: 200,
            headers: vec![],
            body: b"old".to_vec(),
            expires_at: get_current_timestamp() - 1,
        };
        store
            .set_ex("k", &serde_json::to_string(&stale).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.lookup("k").await.is_none());
        assert!(!store.exists("k").await.unwrap());
    }
}
