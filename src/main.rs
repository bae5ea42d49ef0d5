// src/main.rs
use env_logger::Builder;
use log::{error, info, LevelFilter};
use std::sync::Arc;
use stock_trader::config::{Config, StoreBackend};
use stock_trader::db::ScyllaStore;
use stock_trader::store::{MemStore, Store};
use stock_trader::App;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let config = Config::from_env();

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Scylla => match ScyllaStore::init(&config.scylla_addr).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                return;
            }
        },
        StoreBackend::Memory => {
            info!("Using the in-memory store; nothing will survive a restart");
            Arc::new(MemStore::new())
        }
    };
    info!("Connected to database...");

    let app = match App::new(store, &config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start: {}", e);
            return;
        }
    };
    app.spawn_ticker();

    info!("Server running on http://{}", config.bind_addr);
    warp::serve(app.routes()).run(config.bind_addr).await;
}
