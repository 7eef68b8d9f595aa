//! Rate limiting implementation for the edge proxy.
//!
//! Fixed-window counters per client: the first request of a window creates
//! the counter with the window length as its expiry, later requests only
//! increment it. Counters live in the shared [`KvStore`].

use std::sync::Arc;
use std::time::Duration;
use crate::core::store::{KvStore, StoreError};
use crate::models::RateLimitConfig;
use crate::utils::format_key;
use thiserror::Error;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Rate limit exceeded ({count} > {limit})")]
    ExceededLimit { count: u64, limit: u32 },
}

/// Rate limiter over the shared store
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn default_limit(&self) -> u32 {
        self.config.default_limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.window_seconds))
    }

    /// Check a request against the default limit
    pub async fn check_rate_limit(&self, key: &str) -> Result<u64, RateLimitError> {
        self.check_with_limit(key, self.config.default_limit).await
    }

    /// Check if a request should be rate limited
    ///
    /// # Arguments
    ///
    /// * `key` - The key to rate limit (e.g., client IP address)
    /// * `limit` - Requests allowed in the current window
    ///
    /// # Returns
    ///
    /// * `Ok(count)` with the request's position in the window if allowed
    /// * `Err(RateLimitError::ExceededLimit)` if the rate limit has been exceeded
    /// * `Err(RateLimitError::StoreError)` if the store could not be reached
    pub async fn check_with_limit(&self, key: &str, limit: u32) -> Result<u64, RateLimitError> {
        let window_key = format_key("rate_limit", key);
        let count = self.store.incr_ex(&window_key, self.window()).await?;

        if count > u64::from(limit) {
            return Err(RateLimitError::ExceededLimit { count, limit });
        }

        Ok(count)
    }

    /// Reset the rate limit for a given key
    pub async fn reset_rate_limit(&self, key: &str) -> Result<(), RateLimitError> {
        let window_key = format_key("rate_limit", key);
        self.store.del(&window_key).await?;
        Ok(())
    }
}
