// src/lib.rs
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod oracle;
pub mod store;
pub mod ws;

use crate::auth::Identity;
use crate::config::Config;
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::oracle::Oracle;
use crate::store::Store;
use crate::ws::Broadcaster;
use std::sync::Arc;
use std::time::Duration;
use warp::{Filter, Rejection, Reply};

/// The assembled service: identity gate, trading ledger, price oracle and
/// event fan-out over one shared store. Construction seeds the stock board
/// and the id counters; the price tick is started separately so tests can
/// run against frozen prices.
pub struct App {
    pub identity: Identity,
    pub ledger: Ledger,
    pub oracle: Oracle,
    pub events: Broadcaster,
    tick_interval: Duration,
}

impl App {
    pub async fn new(store: Arc<dyn Store>, config: &Config) -> Result<App, AppError> {
        let events = Broadcaster::new(1024);
        let oracle = Oracle::new(store.clone());
        oracle.seed_default_board().await?;

        let last_user_id = store.max_user_id().await?;
        let last_history_id = store.max_history_id().await?;
        let identity = Identity::new(store.clone(), config, last_user_id);
        let ledger = Ledger::new(store, oracle.clone(), events.clone(), last_history_id);

        Ok(App {
            identity,
            ledger,
            oracle,
            events,
            tick_interval: config.tick_interval,
        })
    }

    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        api::routes(
            self.identity.clone(),
            self.ledger.clone(),
            self.oracle.clone(),
            self.events.clone(),
        )
    }

    /// Starts the background price tick at the configured interval.
    pub fn spawn_ticker(&self) {
        oracle::spawn_ticker(
            self.oracle.clone(),
            self.ledger.clone(),
            self.events.clone(),
            self.tick_interval,
        );
    }
}
