// src/oracle.rs
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::models::{round2, Stock};
use crate::store::{Store, StoreError};
use crate::ws::Broadcaster;
use chrono::Utc;
use log::{error, info};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// No price ever falls below this floor, whatever the walk does.
pub const PRICE_FLOOR: Decimal = Decimal::from_parts(1000, 0, 0, false, 2);

/// Tickers tracked out of the box, with base prices in cents.
const DEFAULT_BOARD: &[(&str, &str, i64)] = &[
    ("AAPL", "Apple Inc.", 17850),
    ("GOOGL", "Alphabet Inc.", 14125),
    ("MSFT", "Microsoft Corporation", 41530),
    ("ABNB", "Airbnb Inc.", 15280),
    ("ADBE", "Adobe Inc.", 55990),
];

/// Owns current prices: seeds the board, answers lookups and advances every
/// ticker once per tick with a uniform random walk.
#[derive(Clone)]
pub struct Oracle {
    store: Arc<dyn Store>,
}

impl Oracle {
    pub fn new(store: Arc<dyn Store>) -> Oracle {
        Oracle { store }
    }

    /// Inserts the default board on first start. A store that already has
    /// stocks is left untouched.
    pub async fn seed_default_board(&self) -> Result<(), StoreError> {
        if !self.store.list_stocks().await?.is_empty() {
            return Ok(());
        }
        for (ticker, name, cents) in DEFAULT_BOARD {
            let stock = Stock {
                ticker: ticker.to_string(),
                name: name.to_string(),
                current_price: Decimal::new(*cents, 2),
                last_updated: Utc::now(),
            };
            self.store.upsert_stock(&stock).await?;
        }
        info!("Seeded {} default stocks", DEFAULT_BOARD.len());
        Ok(())
    }

    pub async fn price_of(&self, ticker: &str) -> Result<Decimal, AppError> {
        match self.store.stock(ticker).await? {
            Some(stock) => Ok(stock.current_price),
            None => Err(AppError::TickerNotFound),
        }
    }

    pub async fn list(&self) -> Result<Vec<Stock>, StoreError> {
        self.store.list_stocks().await
    }

    /// One tick of the walk: each price moves by a uniform delta in
    /// [-10.00, +10.00], clamped to the floor and rounded to 2 decimals.
    pub async fn advance(&self) -> Result<Vec<Stock>, StoreError> {
        let mut stocks = self.store.list_stocks().await?;
        for stock in &mut stocks {
            let delta_cents: i64 = rand::rng().random_range(-1000..=1000);
            let next = round2((stock.current_price + Decimal::new(delta_cents, 2)).max(PRICE_FLOOR));
            stock.current_price = next;
            stock.last_updated = Utc::now();
            self.store
                .update_stock_price(&stock.ticker, next, stock.last_updated)
                .await?;
        }
        Ok(stocks)
    }
}

/// Runs the periodic price tick off the request path. A failed iteration is
/// logged and the next one starts on schedule.
pub fn spawn_ticker(oracle: Oracle, ledger: Ledger, events: Broadcaster, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = run_tick(&oracle, &ledger, &events).await {
                error!("price tick failed: {}", e);
            }
        }
    });
}

async fn run_tick(oracle: &Oracle, ledger: &Ledger, events: &Broadcaster) -> Result<(), AppError> {
    let stocks = oracle.advance().await?;
    ledger.recompute_all_total_pl().await?;
    events.price_update(stocks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, User};
    use crate::store::MemStore;
    use crate::ws::Event;
    use rust_decimal_macros::dec;
    use std::collections::{BTreeMap, BTreeSet};

    async fn oracle_with(prices: &[(&str, Decimal)]) -> (Oracle, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        for (ticker, price) in prices {
            store
                .upsert_stock(&Stock {
                    ticker: ticker.to_string(),
                    name: ticker.to_string(),
                    current_price: *price,
                    last_updated: Utc::now(),
                })
                .await
                .unwrap();
        }
        (Oracle::new(store.clone()), store)
    }

    #[tokio::test]
    async fn prices_never_fall_below_the_floor() {
        let (oracle, _store) = oracle_with(&[("AAPL", dec!(10.50))]).await;
        for _ in 0..200 {
            let stocks = oracle.advance().await.unwrap();
            let price = stocks[0].current_price;
            assert!(price >= dec!(10.00), "price {} fell below floor", price);
            assert_eq!(price.round_dp(2), price);
        }
    }

    #[tokio::test]
    async fn one_tick_moves_at_most_ten() {
        let (oracle, _store) = oracle_with(&[("MSFT", dec!(1000.00))]).await;
        for _ in 0..50 {
            let before = oracle.price_of("MSFT").await.unwrap();
            let after = oracle.advance().await.unwrap()[0].current_price;
            let delta = (after - before).abs();
            assert!(delta <= dec!(10.00), "delta {} out of range", delta);
        }
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = Arc::new(MemStore::new());
        let oracle = Oracle::new(store.clone());
        oracle.seed_default_board().await.unwrap();
        oracle.seed_default_board().await.unwrap();

        let stocks = oracle.list().await.unwrap();
        assert_eq!(stocks.len(), 5);
        assert_eq!(oracle.price_of("AAPL").await.unwrap(), dec!(178.50));
    }

    #[tokio::test]
    async fn unknown_ticker_is_reported() {
        let (oracle, _store) = oracle_with(&[]).await;
        let err = oracle.price_of("ZZZZ").await.unwrap_err();
        assert!(matches!(err, AppError::TickerNotFound));
    }

    #[tokio::test]
    async fn a_tick_refreshes_users_then_prices() {
        let (oracle, store) = oracle_with(&[("AAPL", dec!(100.00))]).await;
        let mut holdings = BTreeMap::new();
        holdings.insert(
            "AAPL".to_string(),
            Position {
                qty: 2,
                avg_buy: dec!(90.00),
            },
        );
        store
            .create_user(&User {
                id: 1,
                name: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "hash".to_string(),
                subscriptions: BTreeSet::new(),
                holdings,
                total_pl: dec!(0),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let events = Broadcaster::new(16);
        let ledger = Ledger::new(store.clone() as Arc<dyn Store>, oracle.clone(), events.clone(), 0);
        let mut rx = events.subscribe();

        run_tick(&oracle, &ledger, &events).await.unwrap();

        let price = oracle.price_of("AAPL").await.unwrap();
        let expected = round2((price - dec!(90.00)) * dec!(2));
        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(user.total_pl, expected);

        match rx.recv().await.unwrap() {
            Event::UserUpdate { user } => assert_eq!(user.total_pl, expected),
            other => panic!("expected user_update first, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::PriceUpdate { stocks } => assert_eq!(stocks[0].current_price, price),
            other => panic!("expected price_update, got {:?}", other),
        }
    }
}
