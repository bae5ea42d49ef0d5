// src/ledger.rs
use crate::error::AppError;
use crate::models::{round2, HistoryEntry, Position, TradeAction, User, UserView};
use crate::oracle::Oracle;
use crate::store::{Store, StoreError};
use crate::ws::Broadcaster;
use chrono::Utc;
use dashmap::DashMap;
use log::error;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Trading engine over a user's holdings. Every mutation runs under that
/// user's lock, so two racing requests for the same user serialize instead of
/// overwriting each other's read-modify-write.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    oracle: Oracle,
    events: Broadcaster,
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    next_history_id: Arc<AtomicI64>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Oracle,
        events: Broadcaster,
        last_history_id: i64,
    ) -> Ledger {
        Ledger {
            store,
            oracle,
            events,
            locks: Arc::new(DashMap::new()),
            next_history_id: Arc::new(AtomicI64::new(last_history_id)),
        }
    }

    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn next_entry_id(&self) -> i64 {
        self.next_history_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn load_user(&self, user_id: i64) -> Result<User, AppError> {
        match self.store.user_by_id(user_id).await? {
            Some(user) => Ok(user),
            None => Err(AppError::UserNotFound),
        }
    }

    /// Buys `qty` units at the current price. Opening a position logs a BUY
    /// history entry; adding to one only reweights the average cost.
    pub async fn buy(&self, user_id: i64, ticker: &str, qty: i64) -> Result<UserView, AppError> {
        if qty < 1 {
            return Err(AppError::BadRequest("qty must be at least 1".to_string()));
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut user = self.load_user(user_id).await?;
        let price = self.oracle.price_of(ticker).await?;

        match user.holdings.get_mut(ticker) {
            Some(position) => {
                let old_qty = Decimal::from(position.qty);
                let add_qty = Decimal::from(qty);
                position.avg_buy =
                    round2((old_qty * position.avg_buy + add_qty * price) / (old_qty + add_qty));
                position.qty += qty;
            }
            None => {
                user.holdings.insert(
                    ticker.to_string(),
                    Position {
                        qty,
                        avg_buy: price,
                    },
                );
                let entry = HistoryEntry {
                    id: self.next_entry_id(),
                    user_id,
                    email: user.email.clone(),
                    ticker: ticker.to_string(),
                    action: TradeAction::Buy,
                    qty,
                    buy_price: price,
                    sell_price: None,
                    pl: None,
                    created_at: Utc::now(),
                };
                self.store.append_history(&entry).await?;
            }
        }

        self.store.update_holdings(user_id, &user.holdings).await?;
        let view = user.view();
        self.events.user_update(view.clone());
        Ok(view)
    }

    /// Sells the entire held quantity, realizing P/L against the average
    /// cost, and removes the position.
    pub async fn sell(&self, user_id: i64, ticker: &str) -> Result<UserView, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut user = self.load_user(user_id).await?;
        let position = match user.holdings.get(ticker) {
            Some(position) => position.clone(),
            None => return Err(AppError::HoldingNotFound),
        };
        let price = self.oracle.price_of(ticker).await?;
        let pl = round2((price - position.avg_buy) * Decimal::from(position.qty));

        let entry = HistoryEntry {
            id: self.next_entry_id(),
            user_id,
            email: user.email.clone(),
            ticker: ticker.to_string(),
            action: TradeAction::Sell,
            qty: position.qty,
            buy_price: position.avg_buy,
            sell_price: Some(price),
            pl: Some(pl),
            created_at: Utc::now(),
        };
        self.store.append_history(&entry).await?;

        user.holdings.remove(ticker);
        self.store.update_holdings(user_id, &user.holdings).await?;
        let view = user.view();
        self.events.user_update(view.clone());
        Ok(view)
    }

    /// Adds the ticker to the user's watch list. Subscribing to a ticker the
    /// user does not hold also opens a 1-unit position at the current price,
    /// without a history entry.
    pub async fn subscribe(&self, user_id: i64, ticker: &str) -> Result<UserView, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut user = self.load_user(user_id).await?;
        user.subscriptions.insert(ticker.to_string());
        if !user.holdings.contains_key(ticker) {
            let price = self.oracle.price_of(ticker).await?;
            user.holdings.insert(
                ticker.to_string(),
                Position { qty: 1, avg_buy: price },
            );
        }

        self.store
            .update_portfolio(user_id, &user.subscriptions, &user.holdings)
            .await?;
        let view = user.view();
        self.events.user_update(view.clone());
        Ok(view)
    }

    /// Drops the ticker from the watch list and silently discards any holding
    /// in it. No SELL entry is written and no P/L is realized.
    pub async fn unsubscribe(&self, user_id: i64, ticker: &str) -> Result<UserView, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut user = self.load_user(user_id).await?;
        user.subscriptions.remove(ticker);
        user.holdings.remove(ticker);

        self.store
            .update_portfolio(user_id, &user.subscriptions, &user.holdings)
            .await?;
        let view = user.view();
        self.events.user_update(view.clone());
        Ok(view)
    }

    /// Recomputes the cached unrealized P/L total from current prices.
    /// Tickers no longer on the board are skipped.
    pub async fn recompute_total_pl(&self, user_id: i64) -> Result<UserView, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut user = self.load_user(user_id).await?;
        let total = self.unrealized_total(&user).await?;
        user.total_pl = total;
        self.store.update_total_pl(user_id, total).await?;
        let view = user.view();
        self.events.user_update(view.clone());
        Ok(view)
    }

    async fn unrealized_total(&self, user: &User) -> Result<Decimal, StoreError> {
        let mut total = Decimal::ZERO;
        for (ticker, position) in &user.holdings {
            let stock = match self.store.stock(ticker).await? {
                Some(stock) => stock,
                None => continue,
            };
            total += (stock.current_price - position.avg_buy) * Decimal::from(position.qty);
        }
        Ok(round2(total))
    }

    /// Refreshes every user's cached total. Driven by the price tick; one
    /// user failing does not stop the others.
    pub async fn recompute_all_total_pl(&self) -> Result<(), AppError> {
        for user in self.store.list_users().await? {
            if let Err(e) = self.recompute_total_pl(user.id).await {
                error!("total P/L recompute for user {} failed: {}", user.id, e);
            }
        }
        Ok(())
    }

    pub async fn history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, AppError> {
        Ok(self.store.history_for_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stock;
    use crate::store::MemStore;
    use rust_decimal_macros::dec;
    use std::collections::{BTreeMap, BTreeSet};

    async fn ledger_with(prices: &[(&str, Decimal)]) -> (Ledger, Arc<MemStore>) {
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
        let oracle = Oracle::new(store.clone());
        let events = Broadcaster::new(64);
        let ledger = Ledger::new(store.clone() as Arc<dyn Store>, oracle, events, 0);
        (ledger, store)
    }

    async fn seed_user(store: &MemStore, id: i64) {
        store
            .create_user(&User {
                id,
                name: format!("user{}", id),
                email: format!("user{}@example.com", id),
                password_hash: "hash".to_string(),
                subscriptions: BTreeSet::new(),
                holdings: BTreeMap::new(),
                total_pl: dec!(0),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn opening_buy_creates_position_and_history() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        let view = ledger.buy(1, "AAPL", 3).await.unwrap();
        assert_eq!(view.holdings["AAPL"].qty, 3);
        assert_eq!(view.holdings["AAPL"].avg_buy, dec!(100.00));

        let history = ledger.history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, TradeAction::Buy);
        assert_eq!(history[0].qty, 3);
        assert_eq!(history[0].buy_price, dec!(100.00));
        assert!(history[0].sell_price.is_none());
        assert!(history[0].pl.is_none());
    }

    #[tokio::test]
    async fn additive_buy_reweights_average_without_history() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        ledger.buy(1, "AAPL", 10).await.unwrap();
        store
            .update_stock_price("AAPL", dec!(120.00), Utc::now())
            .await
            .unwrap();
        let view = ledger.buy(1, "AAPL", 10).await.unwrap();

        assert_eq!(view.holdings["AAPL"].qty, 20);
        assert_eq!(view.holdings["AAPL"].avg_buy, dec!(110.00));
        // Only the opening buy is logged.
        assert_eq!(ledger.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn average_cost_rounds_to_two_decimals() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        ledger.buy(1, "AAPL", 1).await.unwrap();
        store
            .update_stock_price("AAPL", dec!(101.00), Utc::now())
            .await
            .unwrap();
        let view = ledger.buy(1, "AAPL", 2).await.unwrap();

        // (1*100 + 2*101) / 3 = 100.666...
        assert_eq!(view.holdings["AAPL"].avg_buy, dec!(100.67));
    }

    #[tokio::test]
    async fn sell_closes_the_whole_position() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        ledger.buy(1, "AAPL", 10).await.unwrap();
        store
            .update_stock_price("AAPL", dec!(120.00), Utc::now())
            .await
            .unwrap();
        ledger.buy(1, "AAPL", 10).await.unwrap();
        store
            .update_stock_price("AAPL", dec!(115.00), Utc::now())
            .await
            .unwrap();

        let view = ledger.sell(1, "AAPL").await.unwrap();
        assert!(view.holdings.is_empty());

        let history = ledger.history(1).await.unwrap();
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].action, TradeAction::Sell);
        assert_eq!(history[0].qty, 20);
        assert_eq!(history[0].buy_price, dec!(110.00));
        assert_eq!(history[0].sell_price, Some(dec!(115.00)));
        assert_eq!(history[0].pl, Some(dec!(100.00)));
    }

    #[tokio::test]
    async fn sell_without_holding_is_reported() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        let err = ledger.sell(1, "AAPL").await.unwrap_err();
        assert!(matches!(err, AppError::HoldingNotFound));
        assert!(ledger.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ticker_buy_changes_nothing() {
        let (ledger, store) = ledger_with(&[]).await;
        seed_user(&store, 1).await;

        let err = ledger.buy(1, "ZZZZ", 1).await.unwrap_err();
        assert!(matches!(err, AppError::TickerNotFound));

        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert!(user.holdings.is_empty());
        assert!(ledger.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_quantity_buy_is_rejected() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        let err = ledger.buy(1, "AAPL", 0).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn concurrent_buys_serialize_per_user() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;

        let (first, second) = tokio::join!(ledger.buy(1, "AAPL", 1), ledger.buy(1, "AAPL", 1));
        first.unwrap();
        second.unwrap();

        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(user.holdings["AAPL"].qty, 2);
        assert_eq!(user.holdings["AAPL"].avg_buy, dec!(100.00));
        // One opening buy, one additive buy: exactly one entry.
        assert_eq!(ledger.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recompute_total_pl_is_idempotent() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;
        ledger.buy(1, "AAPL", 4).await.unwrap();
        store
            .update_stock_price("AAPL", dec!(103.33), Utc::now())
            .await
            .unwrap();

        let first = ledger.recompute_total_pl(1).await.unwrap();
        assert_eq!(first.total_pl, dec!(13.32));
        let second = ledger.recompute_total_pl(1).await.unwrap();
        assert_eq!(second.total_pl, first.total_pl);
    }

    #[tokio::test]
    async fn recompute_skips_delisted_tickers() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(110.00))]).await;
        seed_user(&store, 1).await;

        let mut holdings = BTreeMap::new();
        holdings.insert(
            "AAPL".to_string(),
            Position {
                qty: 1,
                avg_buy: dec!(100.00),
            },
        );
        holdings.insert(
            "GONE".to_string(),
            Position {
                qty: 5,
                avg_buy: dec!(50.00),
            },
        );
        store.update_holdings(1, &holdings).await.unwrap();

        let view = ledger.recompute_total_pl(1).await.unwrap();
        assert_eq!(view.total_pl, dec!(10.00));
    }

    #[tokio::test]
    async fn subscribe_opens_a_default_position() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(178.50))]).await;
        seed_user(&store, 1).await;

        let view = ledger.subscribe(1, "AAPL").await.unwrap();
        assert!(view.subscriptions.contains("AAPL"));
        assert_eq!(view.holdings["AAPL"].qty, 1);
        assert_eq!(view.holdings["AAPL"].avg_buy, dec!(178.50));
        // The implicit position is not a logged trade.
        assert!(ledger.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_keeps_an_existing_position() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;
        ledger.buy(1, "AAPL", 5).await.unwrap();

        let view = ledger.subscribe(1, "AAPL").await.unwrap();
        assert_eq!(view.holdings["AAPL"].qty, 5);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_ticker_changes_nothing() {
        let (ledger, store) = ledger_with(&[]).await;
        seed_user(&store, 1).await;

        let err = ledger.subscribe(1, "ZZZZ").await.unwrap_err();
        assert!(matches!(err, AppError::TickerNotFound));

        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert!(user.subscriptions.is_empty());
        assert!(user.holdings.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_drops_subscription_and_holding() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;
        ledger.buy(1, "AAPL", 5).await.unwrap();
        ledger.subscribe(1, "AAPL").await.unwrap();

        let view = ledger.unsubscribe(1, "AAPL").await.unwrap();
        assert!(view.subscriptions.is_empty());
        assert!(view.holdings.is_empty());
        // The discarded holding realizes nothing: still only the opening buy.
        let history = ledger.history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, TradeAction::Buy);
    }

    #[tokio::test]
    async fn history_is_newest_first_by_entry_id() {
        let (ledger, store) =
            ledger_with(&[("AAPL", dec!(100.00)), ("MSFT", dec!(200.00))]).await;
        seed_user(&store, 1).await;

        ledger.buy(1, "AAPL", 1).await.unwrap();
        ledger.sell(1, "AAPL").await.unwrap();
        ledger.buy(1, "MSFT", 1).await.unwrap();

        let ids: Vec<i64> = ledger
            .history(1)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn mutations_broadcast_the_fresh_snapshot() {
        let (ledger, store) = ledger_with(&[("AAPL", dec!(100.00))]).await;
        seed_user(&store, 1).await;
        let mut rx = ledger.events.subscribe();

        ledger.buy(1, "AAPL", 2).await.unwrap();

        match rx.recv().await.unwrap() {
            crate::ws::Event::UserUpdate { user } => {
                assert_eq!(user.id, 1);
                assert_eq!(user.holdings["AAPL"].qty, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
