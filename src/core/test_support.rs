//! In-process backend used by tests that exercise real HTTP traffic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

#[derive(Clone)]
pub struct TestBackend {
    pub url: String,
    pub hits: Arc<AtomicU64>,
    pub healthy: Arc<AtomicBool>,
}

#[derive(Clone)]
struct BackendState {
    name: String,
    hits: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
}

async fn health(state: web::Data<BackendState>) -> HttpResponse {
    if !state.healthy.load(Ordering::SeqCst) {
        return HttpResponse::ServiceUnavailable().finish();
    }
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "server_id": state.name,
        "connections": 0,
        "threads": 4,
    }))
}

async fn handle(req: HttpRequest, state: web::Data<BackendState>) -> HttpResponse {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    match req.path() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            HttpResponse::Ok().body("slow")
        }
        "/fail" => HttpResponse::InternalServerError().body("boom"),
        "/cached" => HttpResponse::Ok()
            .insert_header(("Cache-Control", "public, max-age=60"))
            .body(format!("{}:{}", state.name, hit)),
        _ => HttpResponse::Ok()
            .insert_header(("X-Backend", state.name.clone()))
            .insert_header((
                "X-Seen-Forwarded-For",
                req.headers()
                    .get("X-Forwarded-For")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string(),
            ))
            .body(format!("{}:{}", state.name, hit)),
    }
}

/// Start a backend on an ephemeral port. Must run inside an actix system.
pub fn spawn_backend(name: &str) -> TestBackend {
    let state = BackendState {
        name: name.to_string(),
        hits: Arc::new(AtomicU64::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
    };
    let backend = TestBackend {
        url: String::new(),
        hits: Arc::clone(&state.hits),
        healthy: Arc::clone(&state.healthy),
    };

    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/health", web::get().to(health))
            .default_service(web::to(handle))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .expect("bind test backend");
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());

    TestBackend {
        url: format!("http://{}", addr),
        ..backend
    }
}

/// A URL nothing listens on
pub fn dead_backend() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind unused port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}", addr)
}
