use std::panic;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use script_collab::clients::{HttpUserDirectory, StaticUserDirectory, UserDirectory};
use script_collab::config::Config;
use script_collab::db::{DbScript, DocumentStore, MemoryDocumentStore};
use script_collab::routes::build_router;
use script_collab::state::AppState;
use script_collab::ws::ChannelHub;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Configuration first so its log level can seed the filter
    let loaded = Config::load();
    let log_filter = match &loaded {
        Ok(config) => config.log_filter(),
        Err(_) => Config::default().log_filter(),
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .init();

    info!("Starting server...");

    let config = loaded.unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Presence store: Postgres when configured, memory otherwise
    let (store, store_kind): (Arc<dyn DocumentStore>, &'static str) = match &config.db_url {
        Some(db_url) => match DbScript::connect(db_url, config.broadcast_capacity).await {
            Ok(db) => {
                info!("Database initialized successfully");
                (Arc::new(db), "postgres")
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Lock status will be served from an empty in-memory store");
                (Arc::new(MemoryDocumentStore::new(config.broadcast_capacity)), "memory")
            }
        },
        None => {
            warn!("No database URL configured - using in-memory presence store");
            (Arc::new(MemoryDocumentStore::new(config.broadcast_capacity)), "memory")
        }
    };

    // User directory for lock holder names
    let directory: Arc<dyn UserDirectory> =
        match (&config.user_directory_url, &config.service_jwt_secret) {
            (Some(url), Some(secret)) => {
                match HttpUserDirectory::new(url.clone(), secret.clone(), config.service_name.clone()) {
                    Ok(directory) => Arc::new(directory),
                    Err(e) => {
                        error!("Failed to create user directory client: {}", e);
                        Arc::new(StaticUserDirectory::default())
                    }
                }
            }
            _ => {
                warn!("No user directory configured - lock holders are shown by user id");
                Arc::new(StaticUserDirectory::default())
            }
        };

    let hub = Arc::new(ChannelHub::new(config.broadcast_capacity));
    let app_state = Arc::new(AppState::new(hub, store, directory, store_kind));
    let app_routes = build_router(app_state);

    // Start the HTTP/API server
    let listener = match tokio::net::TcpListener::bind(config.server_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.server_address(), e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket relay available at ws://{}/ws/{{doc_id}}", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app_routes).await {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}
