//! Country-based request filtering.
//!
//! Lookup failures follow `geo.fail_open`: by default an unresolvable
//! client or a missing database lets the request through and logs a
//! warning, so an infrastructure problem never blocks legitimate users.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use log::{info, warn};
use maxminddb::{geoip2, MaxMindDBError, Reader};
use thiserror::Error;
use crate::core::error::ProxyError;
use crate::models::GeoConfig;

/// Errors that can occur during a country lookup
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("GeoIP lookup failed: {0}")]
    LookupError(#[from] MaxMindDBError),
    #[error("No GeoIP database loaded")]
    NoDatabase,
    #[error("{0} is not in the GeoIP database")]
    NotFound(IpAddr),
}

/// Resolves a client address to an ISO country code
pub trait CountryResolver: Send + Sync {
    /// `Ok(None)` when the address is not in the database
    fn country_code(&self, ip: IpAddr) -> Result<Option<String>, GeoError>;
}

/// MaxMind GeoLite2/GeoIP2 database
pub struct MaxMindResolver {
    reader: Reader<Vec<u8>>,
}

impl MaxMindResolver {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        Ok(Self {
            reader: Reader::open_readfile(path)?,
        })
    }
}

impl CountryResolver for MaxMindResolver {
    fn country_code(&self, ip: IpAddr) -> Result<Option<String>, GeoError> {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => Ok(record
                .country
                .and_then(|c| c.iso_code)
                .map(str::to_string)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

pub struct GeoFilter {
    enabled: bool,
    resolver: Option<Box<dyn CountryResolver>>,
    blocked: HashSet<String>,
    allowed: HashSet<String>,
    fail_open: bool,
}

impl GeoFilter {
    pub fn new(config: &GeoConfig, resolver: Option<Box<dyn CountryResolver>>) -> Self {
        fn normalize(codes: &[String]) -> HashSet<String> {
            codes.iter().map(|c| c.trim().to_ascii_uppercase()).collect()
        }
        Self {
            enabled: config.enabled,
            resolver,
            blocked: normalize(&config.blocked_countries),
            allowed: normalize(&config.allowed_countries),
            fail_open: config.fail_open,
        }
    }

    /// Build the filter, opening the configured database when enabled
    pub fn from_config(config: &GeoConfig) -> Self {
        let resolver: Option<Box<dyn CountryResolver>> = if config.enabled {
            match MaxMindResolver::open(&config.database_path) {
                Ok(resolver) => {
                    info!("GeoIP database loaded from {}", config.database_path);
                    Some(Box::new(resolver))
                }
                Err(e) => {
                    warn!(
                        "GeoIP database not usable at {}: {}; lookups will fail {}",
                        config.database_path,
                        e,
                        if config.fail_open { "open" } else { "closed" }
                    );
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, resolver)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn lookup_failed(&self, ip: &IpAddr, e: GeoError) -> Result<(), ProxyError> {
        if self.fail_open {
            warn!("Geo lookup failed for {}: {}; allowing request", ip, e);
            Ok(())
        } else {
            warn!("Geo lookup failed for {}: {}; rejecting request", ip, e);
            Err(ProxyError::GeoBlocked("unknown".to_string()))
        }
    }

    /// Decide whether `ip` may pass
    pub fn check(&self, ip: &IpAddr) -> Result<(), ProxyError> {
        if !self.enabled || is_local(ip) {
            return Ok(());
        }
        let resolver = match &self.resolver {
            Some(resolver) => resolver,
            None => return self.lookup_failed(ip, GeoError::NoDatabase),
        };

        let code = match resolver.country_code(*ip) {
            Ok(Some(code)) => code.to_ascii_uppercase(),
            Ok(None) => return self.lookup_failed(ip, GeoError::NotFound(*ip)),
            Err(e) => return self.lookup_failed(ip, e),
        };

        if !self.allowed.is_empty() && !self.allowed.contains(&code) {
            warn!("Blocked request from non-allowed country: {}, IP: {}", code, ip);
            return Err(ProxyError::GeoBlocked(code));
        }
        if self.blocked.contains(&code) {
            warn!("Blocked request from blocked country: {}, IP: {}", code, ip);
            return Err(ProxyError::GeoBlocked(code));
        }
        Ok(())
    }
}
