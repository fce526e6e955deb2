pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use api::routes::create_router;
pub use error::{MdrError, MdrResult};
pub use logic::{
    LibraryItemAggregate, LibraryItemOperations, SelectionAggregate, StudySelectionOperations,
};
pub use model::*;
pub use store::{MemoryStore, PostgresStore, Store};

/// Builds the configured store and serves the API until shutdown.
pub async fn run_server(config: config::AppConfig) -> anyhow::Result<()> {
    use crate::config::StorageBackend;
    use std::sync::Arc;

    match config.storage.backend {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            serve(store, &config).await
        }
        StorageBackend::Postgres => {
            let database_url = config.database_url()?;
            log::info!("Connecting to PostgreSQL...");
            let store = PostgresStore::new(&database_url, config.max_connections()).await?;
            log::info!("Running database migrations...");
            store.migrate().await?;
            serve(Arc::new(store), &config).await
        }
    }
}

async fn serve<S: Store + 'static>(
    store: std::sync::Arc<S>,
    config: &config::AppConfig,
) -> anyhow::Result<()> {
    use tokio::net::TcpListener;

    if config.storage.load_seed_data {
        log::info!("Loading seed data...");
        seed::load_seed_data(&*store).await?;
    }

    let app = create_router().with_state(store);
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("MDR versioning server running on http://{}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
