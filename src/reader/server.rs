use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, Uri},
    response::{IntoResponse, Redirect},
    routing::get,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, ApiError, AppState, SharedState};
use super::db::{DbHandle, LibraryDb};
use super::engine::{EngineCell, PythonLoader};
use super::session::SessionRegistry;
use super::ws;
use crate::config::PagewiseConfig;

/// Build the full application router with API, WebSocket, and page routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/", get(index_handler))
        .route("/ws", get(ws::ws_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open a fresh reader session and send the browser to its page.
async fn index_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Redirect, ApiError> {
    let handle = api::open_session(&state, &headers).await?;
    let id = handle.session.lock().await.id;
    Ok(Redirect::to(&format!("/sessions/{}", id)))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}

/// Construct the shared state: open the library database, create the
/// broadcast channel, and prepare the execution engine.
pub fn build_state(config: &PagewiseConfig, project_dir: &Path) -> Result<SharedState> {
    let db_path = config.db_path(project_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = LibraryDb::new(&db_path).context("Failed to initialize library database")?;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);

    let engines = if config.sandbox.enabled {
        tracing::info!(
            timeout_secs = config.sandbox.timeout,
            memory = %config.sandbox.memory,
            image = config.sandbox.image.as_deref().unwrap_or("host"),
            "code sandbox enabled"
        );
        EngineCell::new(Arc::new(PythonLoader::from_config(&config.sandbox)))
    } else {
        tracing::info!("code sandbox disabled by configuration");
        EngineCell::disabled()
    };

    Ok(Arc::new(AppState {
        db: DbHandle::new(db),
        ws_tx,
        sessions: SessionRegistry::new(),
        engines: Arc::new(engines),
        identity: config.identity.clone(),
    }))
}

/// Start the reader server. `on_ready` is called with the bound address
/// before the server begins accepting connections.
pub async fn start_server<F>(config: &PagewiseConfig, project_dir: &Path, on_ready: F) -> Result<()>
where
    F: FnOnce(SocketAddr),
{
    let state = build_state(config, project_dir)?;
    let reaper = config
        .server
        .session_idle_timeout()
        .map(|idle| state.sessions.spawn_reaper(idle));
    if config.server.is_exposed() && config.identity.trusted_proxy_secret.is_none() {
        tracing::warn!("identity headers are trusted from any client; set identity.trusted_proxy_secret");
    }
    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.bind_host(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, dev_mode = config.server.dev_mode, "pagewise server listening");
    on_ready(local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
