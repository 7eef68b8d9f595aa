//! HTTP surface of the edge proxy.
//!
//! `/proxy/*` endpoints report on and administer the proxy itself; every
//! other path is forwarded to the backend cluster.

use std::net::IpAddr;
use std::time::Duration;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::proxy::ProxyState;

/// Largest request body accepted for forwarding
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .service(
            web::scope("/proxy")
                .service(web::resource("/status").route(web::get().to(proxy_status)))
                .service(web::resource("/health").route(web::get().to(health_check)))
                .service(web::resource("/metrics").route(web::get().to(metrics)))
                .service(
                    web::resource("/blacklist/{ip}")
                        .route(web::get().to(get_blacklist_entry))
                        .route(web::post().to(add_blacklist_entry))
                        .route(web::delete().to(remove_blacklist_entry)),
                ),
        )
        .default_service(web::to(proxy_request));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    active_nodes: usize,
}

/// Optional body of a manual blacklist request
#[derive(Debug, Serialize, Deserialize)]
pub struct BlacklistRequest {
    pub duration_seconds: Option<u64>,
}

#[derive(Serialize)]
struct AdminError {
    error: String,
}

fn admin_error(status: actix_web::http::StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(AdminError {
        error: message.into(),
    })
}

/// Admin endpoints answer whitelisted clients only. Returns the target IP.
fn authorize(state: &ProxyState, req: &HttpRequest, ip: &str) -> Result<IpAddr, HttpResponse> {
    let caller = state.client_ip(req);
    if !state.blacklist.is_whitelisted(&caller) {
        warn!("Rejected blacklist administration from {}", caller);
        return Err(admin_error(
            actix_web::http::StatusCode::FORBIDDEN,
            "administration is limited to whitelisted clients",
        ));
    }
    ip.parse().map_err(|_| {
        admin_error(
            actix_web::http::StatusCode::BAD_REQUEST,
            format!("invalid IP address: {}", ip),
        )
    })
}

/// Status endpoint
async fn proxy_status(state: web::Data<ProxyState>) -> impl Responder {
    HttpResponse::Ok().json(state.status_report())
}

/// Health check endpoint
async fn health_check(state: web::Data<ProxyState>) -> impl Responder {
    let active_nodes = state.registry.list_active().len();
    HttpResponse::Ok().json(HealthResponse {
        status: if active_nodes > 0 { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_nodes,
    })
}

/// Prometheus exposition
async fn metrics(state: web::Data<ProxyState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn get_blacklist_entry(
    state: web::Data<ProxyState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let ip = match authorize(&state, &req, &path) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };
    match state.blacklist.record(&ip).await {
        Ok(record) => HttpResponse::Ok().json(record),
        Err(e) => {
            error!("Blacklist lookup failed for {}: {}", ip, e);
            admin_error(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn add_blacklist_entry(
    state: web::Data<ProxyState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: Option<web::Json<BlacklistRequest>>,
) -> HttpResponse {
    let ip = match authorize(&state, &req, &path) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };
    let duration = body
        .and_then(|b| b.duration_seconds)
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.blacklist.default_duration());

    if let Err(e) = state.blacklist.add(&ip, duration).await {
        error!("Failed to blacklist {}: {}", ip, e);
        return admin_error(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    info!("Manually blacklisted IP: {} for {:?}", ip, duration);
    match state.blacklist.record(&ip).await {
        Ok(record) => HttpResponse::Created().json(record),
        Err(e) => admin_error(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn remove_blacklist_entry(
    state: web::Data<ProxyState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let ip = match authorize(&state, &req, &path) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };
    match state.pardon(&ip).await {
        Ok(()) => {
            info!("Removed IP from blacklist: {}", ip);
            HttpResponse::NoContent().finish()
        }
        Err(e) => {
            error!("Failed to remove {} from blacklist: {}", ip, e);
            admin_error(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Everything outside `/proxy` goes to the cluster
async fn proxy_request(
    state: web::Data<ProxyState>,
    req: HttpRequest,
    body: Bytes,
) -> impl Responder {
    state.handle(&req, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use crate::core::geo::GeoFilter;
    use crate::core::store::FallbackStore;
    use crate::core::test_support::spawn_backend;
    use crate::models::Config;

    const ADMIN: &str = "127.0.0.1:50000";
    const VISITOR: &str = "203.0.113.50:50000";

    fn proxy_state(urls: Vec<String>, configure: impl FnOnce(&mut Config)) -> web::Data<ProxyState> {
        let mut config = Config::default();
        config.cluster.nodes = urls;
        configure(&mut config);
        let geo = GeoFilter::new(&config.geo, None);
        web::Data::new(ProxyState::new(config, Arc::new(FallbackStore::local()), geo).unwrap())
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[actix_web::test]
    async fn test_health_check() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url], |_| {}))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::get().uri("/proxy/health").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["active_nodes"], 1);
    }

    #[actix_web::test]
    async fn test_status_and_forwarding() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url.clone()], |_| {}))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/hello?x=1")
            .peer_addr(peer(VISITOR))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, Bytes::from_static(b"a:1"));

        let req = test::TestRequest::get().uri("/proxy/status").to_request();
        let status: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["active_nodes"], serde_json::json!([backend.url]));
        assert_eq!(status["active_node_count"], 1);
        assert_eq!(status["node_stats"][backend.url.as_str()]["requests"], 1);
        assert_eq!(status["sticky_sessions"], false);
    }

    #[actix_web::test]
    async fn test_rate_limit_rejection_body() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url], |config| {
                    config.rate_limit.default_limit = 2;
                }))
                .configure(config),
        )
        .await;

        for _ in 0..2 {
            let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
            assert!(test::call_service(&app, req).await.status().is_success());
        }
        let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["error"], "rate_limited");
    }

    #[actix_web::test]
    async fn test_blacklist_administration() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url], |_| {}))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/proxy/blacklist/203.0.113.50")
            .peer_addr(peer(ADMIN))
            .set_json(BlacklistRequest {
                duration_seconds: Some(600),
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get()
            .uri("/proxy/blacklist/203.0.113.50")
            .peer_addr(peer(ADMIN))
            .to_request();
        let record: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(record["blacklisted"], true);

        let req = test::TestRequest::delete()
            .uri("/proxy/blacklist/203.0.113.50")
            .peer_addr(peer(ADMIN))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    #[actix_web::test]
    async fn test_unblacklisting_resets_the_rate_window() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url], |config| {
                    config.rate_limit.default_limit = 1;
                }))
                .configure(config),
        )
        .await;

        for expected in [StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
            let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
            assert_eq!(test::call_service(&app, req).await.status(), expected);
        }

        let req = test::TestRequest::delete()
            .uri("/proxy/blacklist/203.0.113.50")
            .peer_addr(peer(ADMIN))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/").peer_addr(peer(VISITOR)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_blacklist_administration_requires_whitelist() {
        let backend = spawn_backend("a");
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec![backend.url], |_| {}))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::delete()
            .uri("/proxy/blacklist/203.0.113.50")
            .peer_addr(peer(VISITOR))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get()
            .uri("/proxy/blacklist/not-an-ip")
            .peer_addr(peer(ADMIN))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_metrics_without_recorder() {
        let app = test::init_service(
            App::new()
                .app_data(proxy_state(vec!["http://127.0.0.1:9".to_string()], |_| {}))
                .configure(config),
        )
        .await;
        let req = test::TestRequest::get().uri("/proxy/metrics").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
