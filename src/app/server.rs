use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{self, AppState};
use super::db::{AppDb, DbHandle};
use super::dispatcher::Dispatcher;
use super::runner::runner_from_config;
use super::stream::StatusHub;
use crate::config::WebsConfig;

/// Build the full application router with request tracing.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database, creating its parent directory first.
pub fn open_database(path: &std::path::Path) -> Result<AppDb> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    AppDb::new(path).context("Failed to initialize webs database")
}

/// Assemble shared state from configuration.
pub fn build_state(config: &WebsConfig, db: AppDb) -> Result<Arc<AppState>> {
    let db = DbHandle::new(db);
    let runner = runner_from_config(config)?;
    let workflow_name = runner.workflow_name().to_string();
    Ok(Arc::new(AppState {
        dispatcher: Dispatcher::new(db.clone(), runner, config.webhook_url()),
        hub: StatusHub::new(db.clone(), config.poll_interval()),
        db,
        workflow_name,
        enforce_run_id: config.webhook.enforce_run_id,
        keep_alive: config.keep_alive(),
    }))
}

/// Start the webs server and run until Ctrl+C.
pub async fn start_server(config: WebsConfig) -> Result<()> {
    let db = open_database(&config.database.path)?;
    let state = build_state(&config, db)?;
    let app = build_router(state, config.server.dev);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        webhook_url = %config.webhook_url(),
        workflow = %config.runner.workflow_name,
        "webs server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
