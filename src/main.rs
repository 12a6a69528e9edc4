use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    buffer_pool::BufferPool,
    carrier::CarrierCodec,
    metadata_store::{self, MetadataStore},
    pipeline_service::PipelineService,
    session_service::SessionManager,
    transfer_client::HttpTransferClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        database_url = %cfg.database_url,
        remote = %cfg.remote_base_url,
        chunk_size = cfg.chunk_size,
        "starting pixstash"
    );

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = metadata_store::connect_options(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?;
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let store = MetadataStore::new(db);
    let applied = store.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!(statements = applied, "Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let codec = CarrierCodec::new().context("rendering carrier image")?;
    let transfer = Arc::new(
        HttpTransferClient::new(cfg.remote_base_url.clone())
            .context("building blob host client")?,
    );
    let pool = BufferPool::new(cfg.chunk_size, cfg.buffer_pool_size);
    let pipeline = PipelineService::new(store, transfer, codec, pool);

    let shutdown = CancellationToken::new();
    let sessions = SessionManager::new(chrono::Duration::hours(cfg.session_ttl_hours));
    let sweeper = sessions.spawn_sweeper(
        Duration::from_secs(cfg.session_sweep_secs),
        shutdown.clone(),
    );

    let port = cfg.port;
    let host = cfg.host.clone();
    let addr = cfg.addr();
    let state = state::AppState::new(cfg, pipeline, sessions, shutdown.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes(state);

    // --- Start server ---
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "session sweeper ended abnormally");
    }
    tracing::info!("server stopped");
    Ok(())
}
