//! Edge proxy
//!
//! This is the main entry point of the edge proxy. It loads the
//! configuration, builds the shared state, starts the background tasks
//! and serves traffic.

use std::sync::Arc;
use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context};
use clap::Parser;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use edge_traffic_control::api;
use edge_traffic_control::config::{load_config, CliArgs};
use edge_traffic_control::core::geo::GeoFilter;
use edge_traffic_control::core::proxy::ProxyState;
use edge_traffic_control::core::store::FallbackStore;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    info!("Starting edge proxy on {}:{}...", config.server.host, config.server.port);

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let store = Arc::new(FallbackStore::from_config(&config.redis).await);
    let geo = GeoFilter::from_config(&config.geo);
    let bind = (config.server.host.clone(), config.server.port);
    let initial_probe = config.cluster.initial_probe;

    let state = ProxyState::new(config, store, geo)
        .context("Failed to build HTTP client")?
        .with_metrics(recorder);
    let state = web::Data::new(state);

    let monitor = Arc::new(state.health_monitor());
    if initial_probe {
        let active = monitor.initial_check().await;
        if active == 0 {
            warn!("No backend answered the initial health check");
        }
        info!("Initial health check: {} active nodes", active);
    }
    monitor.spawn();
    state.clone().into_inner().spawn_maintenance();

    for node in state.registry.list_all() {
        info!("Backend {} -> {}", node.id(), node.url());
    }

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind(bind)
    .context("Failed to bind proxy listener")?
    .run()
    .await?;

    Ok(())
}
