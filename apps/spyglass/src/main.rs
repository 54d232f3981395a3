mod cli;
mod config;
mod filters;
mod handlers;
mod peer;
mod protocol;
mod query;
mod registry;
mod rooms;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Watch {
        url,
        peer,
        name,
        token,
    }) = cli.command
    {
        if let Err(err) = cli::run_watch_client(url, peer, name, token).await {
            error!("watch client error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let config = Arc::new(Config::from_env());
    info!("starting spyglass hub on port {}", config.port);

    let registry = Registry::new();
    registry.spawn_diagnostics(Duration::from_secs(config.sweep_interval_seconds));

    let state = AppState {
        registry,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/sockets-list",
            get(handlers::list_all).post(handlers::list_all_filtered),
        )
        .route(
            "/sockets-list/:project_key/autocomplete",
            get(handlers::autocomplete),
        )
        .route(
            "/sockets-list/:project_key",
            get(handlers::list_for_project).post(handlers::list_for_project_filtered),
        )
        .route(
            "/sockets-list/:project_key/:session_id",
            get(handlers::list_for_session),
        )
        .route(
            "/sockets-live",
            get(handlers::live_all).post(handlers::live_all_filtered),
        )
        .route(
            "/sockets-live/:project_key/autocomplete",
            get(handlers::autocomplete),
        )
        .route(
            "/sockets-live/:project_key",
            get(handlers::live_for_project).post(handlers::live_for_project_filtered),
        )
        .route(
            "/sockets-live/:project_key/:session_id",
            get(handlers::live_for_session),
        )
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("spyglass listening on {addr}");

    axum::serve(listener, app).await.expect("server error");
}
