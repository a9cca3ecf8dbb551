mod cli;
mod config;
mod project;
mod protocol;
mod registry;
mod storage;
mod websocket;

use axum::{routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    project::SessionSettings,
    registry::ProjectRegistry,
    storage::open_store,
    websocket::{websocket_handler, RelayState},
};
use clap::Parser;

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Client {
        url,
        project,
        command,
    }) = cli.command
    {
        if let Err(err) = cli::run_client(url, project, command).await {
            error!("client error: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting cloud variable relay on port {}", config.port);
    info!("storage: {}", config.storage_url);
    if config.lock_vars {
        info!("variables are locked: rename/delete are disabled");
    }

    let store = match open_store(&config.storage_url).await {
        Ok(store) => store,
        Err(err) => {
            error!("failed to open storage backend: {err:#}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(ProjectRegistry::new(
        SessionSettings {
            lock_vars: config.lock_vars,
            save_debounce: Duration::from_millis(config.save_debounce_ms),
            save_prefix: config.save_prefix.clone(),
        },
        store,
    ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(RelayState { registry })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
