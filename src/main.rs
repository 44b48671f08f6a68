use std::net::SocketAddr;

use authgate::{
    app::{create_router, spawn_maintenance, AppState},
    config::{Config, ConfigError},
    db,
};
use tracing_subscriber::EnvFilter;

/// Failures that stop the server from starting
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("authgate=debug,tower_http=info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    tracing::info!("Authgate - Starting...");

    let config = Config::from_env()?;

    let state = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url, config.store_timeout).await?;
            db::run_migrations(&pool).await?;
            AppState::with_database(&config, pool)?
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            AppState::in_memory(&config)?
        }
    };

    let maintenance = spawn_maintenance(state.clone(), config.sweep_interval);
    let app = create_router(state, config.request_timeout);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Authgate is running on http://{}", addr);
    tracing::info!("OpenAPI document at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    tracing::info!("Authgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
