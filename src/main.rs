use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::config::AppConfig;
use audit_ledger::crypto::{spawn_keyring_watcher, KeyManager, KeyProvider};
use audit_ledger::database::Database;
use audit_ledger::server::{self, AppState};
use audit_ledger::store::{ChainStore, SqliteChainStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit ledger");

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let database = Database::new(&config.database.url, config.database.max_connections).await?;
    info!("Database connected");

    database.run_migrations().await?;
    info!("Database migrations completed");

    let keyring_path = Path::new(&config.signing.keyring_path);
    let keys = Arc::new(KeyManager::load_or_create(
        keyring_path,
        config.signing.generate_if_missing,
    )?);
    // refuse to start without something to sign with
    let active_key = keys.current_key_id()?;
    info!("Signing with key {}", active_key);

    let shutdown = CancellationToken::new();
    let watcher = if config.signing.reload_interval_secs > 0 {
        info!(
            "Watching keyring {:?} every {}s",
            keyring_path, config.signing.reload_interval_secs
        );
        Some(spawn_keyring_watcher(
            keys.clone(),
            keyring_path.to_path_buf(),
            Duration::from_secs(config.signing.reload_interval_secs),
            shutdown.clone(),
        ))
    } else {
        None
    };

    let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::new(database.pool().clone()));
    let state = AppState::new(store, keys, &config);
    let app = server::router(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    database.close().await;
    info!("Audit ledger stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
