//! Per-client concurrent connection limiting (Slowloris protection).

use std::sync::Arc;
use std::time::Duration;
use log::{error, warn};
use thiserror::Error;
use crate::core::store::{KvStore, StoreError};
use crate::models::ConnectionLimitConfig;
use crate::utils::format_key;

/// Errors that can occur while acquiring a connection slot
#[derive(Error, Debug)]
pub enum ConnectionLimitError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Connection limit exceeded ({count} > {cap})")]
    Capped { count: u64, cap: u32 },
}

/// Slow responses after which a client gets the slow-client cap
pub const SLOW_STRIKES: u64 = 3;

pub struct ConnectionLimiter {
    store: Arc<dyn KvStore>,
    config: ConnectionLimitConfig,
}

impl ConnectionLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: ConnectionLimitConfig) -> Self {
        Self { store, config }
    }

    /// Cap for a client; slow clients get a quarter of it
    pub fn cap_for(&self, slow_client: bool) -> u32 {
        if slow_client {
            (self.config.max_per_client / 4).max(1)
        } else {
            self.config.max_per_client
        }
    }

    /// Take a connection slot for `client` or fail immediately. Clients
    /// with [`SLOW_STRIKES`] recent slow responses get the slow-client cap.
    pub async fn acquire(
        self: &Arc<Self>,
        client: &str,
        slow_client: bool,
    ) -> Result<ConnectionLease, ConnectionLimitError> {
        let slow_client = slow_client || self.slow_strikes(client).await? >= SLOW_STRIKES;
        let key = format_key("connections", client);
        let ttl = Duration::from_secs(self.config.lease_timeout_seconds.max(1));
        let count = self.store.incr_refresh(&key, ttl).await?;

        let cap = self.cap_for(slow_client);
        if count > u64::from(cap) {
            self.store.decr(&key).await?;
            return Err(ConnectionLimitError::Capped { count, cap });
        }

        Ok(ConnectionLease {
            limiter: Arc::clone(self),
            key,
            released: false,
        })
    }

    pub fn is_slow_response(&self, elapsed: Duration) -> bool {
        elapsed.as_secs_f64() > self.config.slow_response_seconds
    }

    /// Count a slow response against `client`, returning its strikes
    pub async fn record_slow_response(&self, client: &str, elapsed: Duration) -> Result<u64, StoreError> {
        let ttl = Duration::from_secs(self.config.slow_tracking_seconds.max(1));
        let strikes = self.store.incr_refresh(&format_key("slow", client), ttl).await?;
        warn!(
            "Slow request detected from IP: {}, time: {:.2}s",
            client,
            elapsed.as_secs_f64()
        );
        if strikes == SLOW_STRIKES {
            warn!("Multiple slow requests from IP: {}, reducing connection limit", client);
        }
        metrics::increment_counter!("edge_slow_responses_total");
        Ok(strikes)
    }

    async fn slow_strikes(&self, client: &str) -> Result<u64, StoreError> {
        let value = self.store.get(&format_key("slow", client)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn release_key(&self, key: &str) {
        if let Err(e) = self.store.decr(key).await {
            error!("Failed to release connection slot {}: {}", key, e);
        }
    }

    /// Open connections currently counted for `client`
    pub async fn open_connections(&self, client: &str) -> Result<u64, StoreError> {
        let value = self.store.get(&format_key("connections", client)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

/// An open client connection. Release it with [`ConnectionLease::release`];
/// a lease dropped without release (cancelled request) is released on a
/// background task.
pub struct ConnectionLease {
    limiter: Arc<ConnectionLimiter>,
    key: String,
    released: bool,
}

impl ConnectionLease {
    pub async fn release(mut self) {
        self.released = true;
        self.limiter.release_key(&self.key).await;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let limiter = Arc::clone(&self.limiter);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { limiter.release_key(&key).await });
            }
            Err(_) => error!("Connection lease {} dropped outside a runtime", key),
        }
    }
}
