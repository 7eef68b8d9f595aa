//! Whitelist, violation tracking and blacklist escalation.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use log::warn;
use serde::Serialize;
use crate::core::store::{KvStore, StoreError};
use crate::models::BlacklistConfig;
use crate::utils::format_key;

/// Result of recording a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub violations: u64,
    /// The client was blacklisted by this violation
    pub blacklisted: bool,
}

/// What is known about a client, for the admin endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub ip: String,
    pub whitelisted: bool,
    pub blacklisted: bool,
    pub violations: u64,
}

pub struct Blacklist {
    store: Arc<dyn KvStore>,
    config: BlacklistConfig,
    whitelist: HashSet<IpAddr>,
}

impl Blacklist {
    pub fn new(store: Arc<dyn KvStore>, config: BlacklistConfig) -> Self {
        let whitelist = config
            .whitelist
            .iter()
            .filter_map(|entry| match entry.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring invalid whitelist entry: {}", entry);
                    None
                }
            })
            .collect();
        Self {
            store,
            config,
            whitelist,
        }
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(self.config.duration_seconds.max(1))
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Expired entries are gone through the store's TTL.
    pub async fn is_blacklisted(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        self.store
            .exists(&format_key("blacklist", &ip.to_string()))
            .await
    }

    /// Count a rate or connection violation, blacklisting the client once
    /// the threshold is reached within the tracking period
    pub async fn record_violation(&self, ip: &IpAddr) -> Result<ViolationOutcome, StoreError> {
        let client = ip.to_string();
        let violations = self
            .store
            .incr_ex(&format_key("violations", &client), self.duration())
            .await?;

        let blacklisted = violations >= u64::from(self.config.violation_threshold)
            && !self.is_blacklisted(ip).await?;
        if blacklisted {
            self.add(ip, self.duration()).await?;
            warn!(
                "Blacklisted IP for repeated violations: {} ({} violations)",
                client, violations
            );
            metrics::increment_counter!("edge_blacklisted_total");
        }

        Ok(ViolationOutcome {
            violations,
            blacklisted,
        })
    }

    pub async fn add(&self, ip: &IpAddr, duration: Duration) -> Result<(), StoreError> {
        self.store
            .set_ex(&format_key("blacklist", &ip.to_string()), "1", duration)
            .await
    }

    /// Lift a blacklist entry and forget the violations behind it
    pub async fn remove(&self, ip: &IpAddr) -> Result<(), StoreError> {
        let client = ip.to_string();
        self.store.del(&format_key("blacklist", &client)).await?;
        self.store.del(&format_key("violations", &client)).await
    }

    pub async fn record(&self, ip: &IpAddr) -> Result<ClientRecord, StoreError> {
        let client = ip.to_string();
        let violations = self
            .store
            .get(&format_key("violations", &client))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ClientRecord {
            whitelisted: self.is_whitelisted(ip),
            blacklisted: self.is_blacklisted(ip).await?,
            violations,
            ip: client,
        })
    }

    pub fn default_duration(&self) -> Duration {
        self.duration()
    }

    pub fn violation_threshold(&self) -> u32 {
        self.config.violation_threshold
    }
}
