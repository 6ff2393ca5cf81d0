use std::sync::Arc;

use boardsync::config::Config;
use boardsync::db::memory::MemoryStore;
use boardsync::db::{self, DurableStore, PgStore};
use boardsync::routes;
use boardsync::services::participant::{ParticipantOptions, spawn_participant};
use boardsync::services::replication::Role;
use boardsync::services::transport;
use boardsync::state::AppState;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Err(e) = dotenv {
        debug!(error = %e, "no .env file loaded");
    }

    let config = Config::from_env();

    let durable: Arc<dyn DurableStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections).await?;
            Arc::new(PgStore::new(pool, config.room.clone()))
        }
        None => {
            warn!("DATABASE_URL not set; board is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(config.client_queue_capacity);

    // The authority joins the relay like any other participant: in-process
    // by default, or over a websocket when the relay runs elsewhere.
    let options = ParticipantOptions::new(Role::Authority, config.participant_label.clone())
        .with_durable(durable)
        .with_persist(config.persist);
    let link = match config.relay_url.as_deref() {
        Some(base) => transport::connect(&transport::relay_url(base, &config.room, options.id)).await?,
        None => state.join_local(&config.room, options.id).await,
    };
    let authority = spawn_participant(link, options).await?;
    info!(id = %authority.id(), room = %config.room, "authority ready");

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!(port = config.port, "boardsync listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // Waits for in-flight writes and the worker's own final save.
    authority.shutdown().await;
    info!("boardsync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; shutting down");
    }
    info!("shutdown requested");
}
