// src/store.rs
use crate::models::{HistoryEntry, Position, Stock, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(String),
    #[error("malformed row: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence boundary for users, stocks and trade history. Backed by
/// ScyllaDB in production and by [`MemStore`] in development and tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new user iff the email is not taken. Returns `false` when
    /// the email already exists; nothing is written in that case.
    async fn create_user(&self, user: &User) -> Result<bool, StoreError>;
    async fn user_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn update_holdings(
        &self,
        user_id: i64,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError>;
    async fn update_portfolio(
        &self,
        user_id: i64,
        subscriptions: &BTreeSet<String>,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError>;
    async fn update_total_pl(&self, user_id: i64, total_pl: Decimal) -> Result<(), StoreError>;

    async fn upsert_stock(&self, stock: &Stock) -> Result<(), StoreError>;
    async fn stock(&self, ticker: &str) -> Result<Option<Stock>, StoreError>;
    async fn list_stocks(&self) -> Result<Vec<Stock>, StoreError>;
    async fn update_stock_price(
        &self,
        ticker: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError>;
    /// All entries for one user, newest first (descending by entry id).
    async fn history_for_user(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn max_user_id(&self) -> Result<i64, StoreError>;
    async fn max_history_id(&self) -> Result<i64, StoreError>;
}

#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

#[derive(Default)]
struct MemInner {
    users: BTreeMap<i64, User>,
    stocks: BTreeMap<String, Stock>,
    history: Vec<HistoryEntry>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_user(&self, user: &User) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.email == user.email) {
            return Ok(false);
        }
        inner.users.insert(user.id, user.clone());
        Ok(true)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.read().await.users.values().cloned().collect())
    }

    async fn update_holdings(
        &self,
        user_id: i64,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.holdings = holdings.clone();
        }
        Ok(())
    }

    async fn update_portfolio(
        &self,
        user_id: i64,
        subscriptions: &BTreeSet<String>,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.subscriptions = subscriptions.clone();
            user.holdings = holdings.clone();
        }
        Ok(())
    }

    async fn update_total_pl(&self, user_id: i64, total_pl: Decimal) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.total_pl = total_pl;
        }
        Ok(())
    }

    async fn upsert_stock(&self, stock: &Stock) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.stocks.insert(stock.ticker.clone(), stock.clone());
        Ok(())
    }

    async fn stock(&self, ticker: &str) -> Result<Option<Stock>, StoreError> {
        Ok(self.inner.read().await.stocks.get(ticker).cloned())
    }

    async fn list_stocks(&self) -> Result<Vec<Stock>, StoreError> {
        Ok(self.inner.read().await.stocks.values().cloned().collect())
    }

    async fn update_stock_price(
        &self,
        ticker: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(stock) = inner.stocks.get_mut(ticker) {
            stock.current_price = price;
            stock.last_updated = at;
        }
        Ok(())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.inner.write().await.history.push(entry.clone());
        Ok(())
    }

    async fn history_for_user(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<HistoryEntry> = inner
            .history
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(entries)
    }

    async fn max_user_id(&self) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.users.keys().max().copied().unwrap_or(0))
    }

    async fn max_history_id(&self) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.history.iter().map(|e| e.id).max().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;
    use rust_decimal_macros::dec;

    fn user(id: i64, email: &str) -> User {
        User {
            id,
            name: format!("user{}", id),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            subscriptions: BTreeSet::new(),
            holdings: BTreeMap::new(),
            total_pl: dec!(0),
            created_at: Utc::now(),
        }
    }

    fn entry(id: i64, user_id: i64) -> HistoryEntry {
        HistoryEntry {
            id,
            user_id,
            email: "a@b.c".to_string(),
            ticker: "AAPL".to_string(),
            action: TradeAction::Buy,
            qty: 1,
            buy_price: dec!(100),
            sell_price: None,
            pl: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate_email() {
        let store = MemStore::new();
        assert!(store.create_user(&user(1, "a@b.c")).await.unwrap());
        assert!(!store.create_user(&user(2, "a@b.c")).await.unwrap());
        assert_eq!(store.list_users().await.unwrap().len(), 1);
        assert_eq!(store.max_user_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn history_is_per_user_and_newest_first() {
        let store = MemStore::new();
        store.append_history(&entry(1, 7)).await.unwrap();
        store.append_history(&entry(2, 9)).await.unwrap();
        store.append_history(&entry(3, 7)).await.unwrap();

        let entries = store.history_for_user(7).await.unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(store.max_history_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn max_ids_start_at_zero() {
        let store = MemStore::new();
        assert_eq!(store.max_user_id().await.unwrap(), 0);
        assert_eq!(store.max_history_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_portfolio_replaces_subscriptions_and_holdings() {
        let store = MemStore::new();
        store.create_user(&user(1, "a@b.c")).await.unwrap();

        let mut subscriptions = BTreeSet::new();
        subscriptions.insert("AAPL".to_string());
        let mut holdings = BTreeMap::new();
        holdings.insert(
            "AAPL".to_string(),
            Position {
                qty: 1,
                avg_buy: dec!(178.50),
            },
        );
        store
            .update_portfolio(1, &subscriptions, &holdings)
            .await
            .unwrap();

        let stored = store.user_by_id(1).await.unwrap().unwrap();
        assert!(stored.subscriptions.contains("AAPL"));
        assert_eq!(stored.holdings["AAPL"].qty, 1);
    }
}
