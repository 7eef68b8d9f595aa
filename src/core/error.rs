//! Client-facing error taxonomy of the proxy.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Errors that terminate a proxied request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("No backend servers available")]
    NodeUnavailable,
    #[error("Backend {0} did not respond in time")]
    UpstreamTimeout(String),
    #[error("Backend {node} failed: {reason}")]
    UpstreamError { node: String, reason: String },
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Connection limit exceeded")]
    ConnectionCapped,
    #[error("Client is blacklisted")]
    Blacklisted,
    #[error("Requests from {0} are not accepted")]
    GeoBlocked(String),
}

impl ProxyError {
    /// Stable short name used in responses, logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NodeUnavailable => "node_unavailable",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::RateLimited => "rate_limited",
            ProxyError::ConnectionCapped => "connection_capped",
            ProxyError::Blacklisted => "blacklisted",
            ProxyError::GeoBlocked(_) => "geo_blocked",
        }
    }

    /// Whether the client caused the rejection and it counts as a violation
    pub fn is_violation(&self) -> bool {
        matches!(self, ProxyError::RateLimited | ProxyError::ConnectionCapped)
    }
}

/// Body of every rejection
#[derive(Debug, Serialize)]
struct RejectionResponse {
    allowed: bool,
    error: &'static str,
    message: String,
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NodeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RateLimited | ProxyError::ConnectionCapped => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::Blacklisted | ProxyError::GeoBlocked(_) => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(RejectionResponse {
            allowed: false,
            error: self.kind(),
            message: self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::NodeUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::UpstreamTimeout("a".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::UpstreamError { node: "a".into(), reason: "reset".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ProxyError::ConnectionCapped.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ProxyError::Blacklisted.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::GeoBlocked("CN".into()).status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn only_client_limits_are_violations() {
        assert!(ProxyError::RateLimited.is_violation());
        assert!(ProxyError::ConnectionCapped.is_violation());
        assert!(!ProxyError::Blacklisted.is_violation());
        assert!(!ProxyError::NodeUnavailable.is_violation());
    }
}
