//! Traffic anomaly detection for the edge proxy.
//!
//! Two signals are tracked:
//!
//! * a global one, where requests and errors are aggregated in fixed buckets
//!   and every closed bucket is compared against an exponentially weighted
//!   baseline of the buckets before it;
//! * a per-client one, a sliding window of request timestamps compared
//!   against the client's share of the rate-limit budget.
//!
//! Detection is a soft signal. What happens next is decided by
//! [`AnomalyAction`] in the middleware.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use crate::models::{AnomalyConfig, RateLimitConfig};

/// Response to a detected anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyAction {
    /// Log a warning only
    LogOnly,
    /// Temporarily divide the rate limit by `tighten_factor`
    Tighten,
    /// Count a violation against the client
    Blacklist,
}

/// Where an anomaly was seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyScope {
    Global,
    Client,
}

/// Below this the error ratio is never anomalous
const ERROR_RATIO_FLOOR: f64 = 0.05;
/// Baseline request rate is never taken to be lower than this (req/s)
const RATE_FLOOR: f64 = 1.0;
/// Idle buckets replayed into the baseline at most
const MAX_IDLE_BUCKETS: u64 = 32;

#[derive(Debug)]
struct GlobalWindow {
    bucket_start: Instant,
    requests: u64,
    errors: u64,
    baseline_rate: f64,
    baseline_error_ratio: f64,
    buckets_seen: u32,
    anomalous: bool,
}

/// Serializable view of the detector for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AnomalySnapshot {
    pub baseline_rate: f64,
    pub baseline_error_ratio: f64,
    pub buckets_seen: u32,
    pub anomalous: bool,
    pub tracked_clients: usize,
    pub tightened_clients: usize,
    pub globally_tightened: bool,
    pub action: AnomalyAction,
}

/// Anomaly detector
pub struct AnomalyDetector {
    config: AnomalyConfig,
    /// Requests a single client may make in `client_window_seconds`
    client_budget: f64,
    global: Mutex<GlobalWindow>,
    clients: DashMap<IpAddr, VecDeque<Instant>>,
    tightened: DashMap<IpAddr, Instant>,
    global_tightened_until: Mutex<Option<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AnomalyDetector {
    /// Create a new anomaly detector instance
    pub fn new(config: AnomalyConfig, rate_limit: &RateLimitConfig) -> Self {
        let client_budget = f64::from(rate_limit.default_limit) * config.client_window_seconds as f64
            / f64::from(rate_limit.window_seconds.max(1))
            * config.client_threshold;
        Self {
            client_budget,
            global: Mutex::new(GlobalWindow {
                bucket_start: Instant::now(),
                requests: 0,
                errors: 0,
                baseline_rate: 0.0,
                baseline_error_ratio: 0.0,
                buckets_seen: 0,
                anomalous: false,
            }),
            clients: DashMap::new(),
            tightened: DashMap::new(),
            global_tightened_until: Mutex::new(None),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn action(&self) -> AnomalyAction {
        self.config.action
    }

    fn bucket(&self) -> Duration {
        Duration::from_secs(self.config.bucket_seconds.max(1))
    }

    /// Close every bucket that has elapsed. Returns true when the bucket
    /// that just closed was flagged.
    fn roll(&self, window: &mut GlobalWindow, now: Instant) -> bool {
        let bucket = self.bucket();
        let elapsed = now.saturating_duration_since(window.bucket_start);
        if elapsed < bucket {
            return false;
        }

        let secs = bucket.as_secs_f64();
        let rate = window.requests as f64 / secs;
        let error_ratio = if window.requests == 0 {
            0.0
        } else {
            window.errors as f64 / window.requests as f64
        };

        let flagged = window.buckets_seen >= self.config.min_baseline_buckets
            && (rate > self.config.rate_multiplier * window.baseline_rate.max(RATE_FLOOR)
                || (error_ratio > ERROR_RATIO_FLOOR
                    && error_ratio > self.config.error_multiplier * window.baseline_error_ratio));

        if flagged {
            warn!(
                "Traffic anomaly: {:.1} req/s (baseline {:.1}), error ratio {:.2} (baseline {:.2})",
                rate, window.baseline_rate, error_ratio, window.baseline_error_ratio
            );
            metrics::increment_counter!("edge_anomalies_total", "scope" => "global");
        }
        window.anomalous = flagged;

        self.absorb(window, rate, error_ratio);
        let idle = ((elapsed.as_secs_f64() / secs) as u64).saturating_sub(1);
        for _ in 0..idle.min(MAX_IDLE_BUCKETS) {
            self.absorb(window, 0.0, 0.0);
        }

        if idle > MAX_IDLE_BUCKETS {
            window.bucket_start = now;
        } else {
            window.bucket_start += bucket * (idle as u32 + 1);
        }
        window.requests = 0;
        window.errors = 0;
        flagged
    }

    fn absorb(&self, window: &mut GlobalWindow, rate: f64, error_ratio: f64) {
        if window.buckets_seen == 0 {
            window.baseline_rate = rate;
            window.baseline_error_ratio = error_ratio;
        } else {
            let alpha = self.config.baseline_alpha;
            window.baseline_rate = alpha * rate + (1.0 - alpha) * window.baseline_rate;
            window.baseline_error_ratio =
                alpha * error_ratio + (1.0 - alpha) * window.baseline_error_ratio;
        }
        window.buckets_seen = window.buckets_seen.saturating_add(1);
    }

    /// Track an incoming request.
    ///
    /// Returns `Some(Client)` while `ip` exceeds its budget, or
    /// `Some(Global)` once per flagged bucket.
    pub fn observe_request(&self, ip: &IpAddr) -> Option<AnomalyScope> {
        let now = Instant::now();

        let global_flagged = {
            let mut window = lock(&self.global);
            let flagged = self.roll(&mut window, now);
            window.requests += 1;
            flagged
        };

        let client_count = {
            let mut history = self.clients.entry(*ip).or_default();
            let horizon = Duration::from_secs(self.config.client_window_seconds);
            while history
                .front()
                .map_or(false, |t| now.saturating_duration_since(*t) > horizon)
            {
                history.pop_front();
            }
            history.push_back(now);
            history.len()
        };

        if client_count as f64 > self.client_budget {
            debug!("Anomaly detected for IP: {}, request count: {}", ip, client_count);
            metrics::increment_counter!("edge_anomalies_total", "scope" => "client");
            return Some(AnomalyScope::Client);
        }
        global_flagged.then_some(AnomalyScope::Global)
    }

    /// Track the outcome of a forwarded request
    pub fn observe_outcome(&self, error: bool) {
        let mut window = lock(&self.global);
        self.roll(&mut window, Instant::now());
        if error {
            window.errors += 1;
        }
    }

    /// Apply the stricter limit to a client, or to everyone for a global anomaly
    pub fn tighten(&self, scope: AnomalyScope, ip: &IpAddr) {
        let until = Instant::now() + Duration::from_secs(self.config.tighten_seconds);
        match scope {
            AnomalyScope::Client => {
                self.tightened.insert(*ip, until);
            }
            AnomalyScope::Global => {
                *lock(&self.global_tightened_until) = Some(until);
            }
        }
    }

    /// Rate limit to use for `ip` given the configured `base`
    pub fn effective_limit(&self, ip: &IpAddr, base: u32) -> u32 {
        let now = Instant::now();
        let global = lock(&self.global_tightened_until).map_or(false, |until| now < until);
        let client = self.tightened.get(ip).map_or(false, |until| now < *until);
        if global || client {
            (base / self.config.tighten_factor.max(1)).max(1)
        } else {
            base
        }
    }

    /// Forget clients with no recent requests and expired tightenings
    pub fn purge(&self) {
        let now = Instant::now();
        let horizon = Duration::from_secs(self.config.client_window_seconds);
        self.clients.retain(|_, history| {
            history
                .back()
                .map_or(false, |t| now.saturating_duration_since(*t) <= horizon)
        });
        self.tightened.retain(|_, until| now < *until);
    }

    pub fn snapshot(&self) -> AnomalySnapshot {
        let now = Instant::now();
        let window = lock(&self.global);
        AnomalySnapshot {
            baseline_rate: window.baseline_rate,
            baseline_error_ratio: window.baseline_error_ratio,
            buckets_seen: window.buckets_seen,
            anomalous: window.anomalous,
            tracked_clients: self.clients.len(),
            tightened_clients: self.tightened.iter().filter(|u| now < *u.value()).count(),
            globally_tightened: lock(&self.global_tightened_until)
                .map_or(false, |until| now < until),
            action: self.config.action,
        }
    }
}
