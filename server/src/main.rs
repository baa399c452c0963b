mod app;
mod authority;
mod clock;
mod config;
mod db_migrations;
mod db_sqlx;
mod identity;
mod ledger;
mod progression;
mod router;
mod routes;
mod services;
mod state;
mod store;

extern crate self as sqlx;
pub use crate::db_sqlx::{PgPool, Postgres, QueryBuilder, postgres, query, query_as};

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::identity::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};
use crate::progression::{HttpProgressionHook, NoopProgression, ProgressionHook};
use crate::state::{AppState, Collaborators, build_http_client};
use crate::store::{MemoryPixelStore, PgPixelStore, PixelStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store: Arc<dyn PixelStore> = match config::database_url() {
        Some(database_url) => {
            let db_max_connections = config::db_max_connections();
            tracing::info!(db_max_connections, "Connecting to PostgreSQL...");
            let pool = match PgPoolOptions::new()
                .max_connections(db_max_connections)
                .connect(&database_url)
                .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::error!(error = %e, "failed to connect to PostgreSQL");
                    return;
                }
            };
            if let Err(e) = db_migrations::run(&pool).await {
                tracing::error!(error = %e, "failed to run migrations");
                return;
            }
            tracing::info!("Database connected and migrations applied");
            Arc::new(PgPixelStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, pixels are kept in memory only");
            Arc::new(MemoryPixelStore::new())
        }
    };

    let http = build_http_client();
    let identity: Arc<dyn IdentityProvider> = match config::identity_url() {
        Some(url) => {
            tracing::info!(%url, "Resolving tokens against the identity service");
            Arc::new(HttpIdentityProvider::new(http.clone(), &url))
        }
        None => {
            let provider = StaticIdentityProvider::parse(&config::dev_tokens().unwrap_or_default());
            if provider.is_empty() {
                tracing::warn!("IDENTITY_URL and DEV_TOKENS unset, every client is anonymous");
            } else {
                tracing::info!(tokens = provider.len(), "Using static development tokens");
            }
            Arc::new(provider)
        }
    };
    let progression: Arc<dyn ProgressionHook> = match config::progression_url() {
        Some(url) => {
            tracing::info!(%url, "Forwarding accepted paints to the progression service");
            Arc::new(HttpProgressionHook::new(http, &url))
        }
        None => Arc::new(NoopProgression),
    };

    let settings = Settings::from_env();
    tracing::info!(
        cell_size_microdeg = settings.cell_size_microdeg,
        room_size_cells = settings.room_size_cells,
        conflict_policy = %settings.conflict_policy,
        "Canvas settings loaded"
    );
    let (state, queues) = AppState::new(
        settings,
        Collaborators {
            identity,
            progression,
            store: Arc::clone(&store),
            clock: Arc::new(SystemClock),
        },
    );

    match store.load_live().await {
        Ok(pixels) => {
            let loaded = state.authority.load(pixels);
            tracing::info!(
                loaded,
                seq = state.authority.current_seq(),
                "Restored live canvas from store"
            );
        }
        Err(e) => tracing::warn!(error = %e, "failed to restore live canvas, starting empty"),
    }
    match store.painted_counts().await {
        Ok(counts) => state.authority.seed_painted_counts(counts),
        Err(e) => tracing::warn!(error = %e, "failed to restore painted counts"),
    }

    // Spawn background services
    tokio::spawn(services::pixel_persister::run(
        state.clone(),
        queues.persist_rx,
    ));
    tokio::spawn(services::progression_worker::run(
        state.clone(),
        queues.progression_rx,
        queues.progression,
    ));
    tokio::spawn(services::rate_status_broadcaster::run(state.clone()));

    let app = app::build_app(state);

    let addr = format!("0.0.0.0:{}", config::server_port());
    tracing::info!("youplace server listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind TCP listener");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server failed");
    }

    tracing::info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
