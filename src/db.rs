// src/db.rs
use crate::models::{HistoryEntry, Position, Stock, TradeAction, User};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use scylla::frame::response::result::{CqlValue, Row};
use scylla::query::Query;
use scylla::transport::errors::QueryError;
use scylla::{Session, SessionBuilder};
use std::collections::{BTreeMap, BTreeSet};

pub struct ScyllaStore {
    session: Session,
}

impl From<QueryError> for StoreError {
    fn from(e: QueryError) -> StoreError {
        StoreError::Backend(e.to_string())
    }
}

impl ScyllaStore {
    pub async fn init(addr: &str) -> Result<ScyllaStore, Box<dyn std::error::Error>> {
        let session = SessionBuilder::new().known_node(addr).build().await?;

        // Create keyspace and tables if they don't exist
        session.query("CREATE KEYSPACE IF NOT EXISTS stock_trader WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS stock_trader.users (id BIGINT PRIMARY KEY, name TEXT, email TEXT, password_hash TEXT, subscriptions TEXT, holdings TEXT, total_pl DOUBLE, created_at TIMESTAMP)", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS stock_trader.users_by_email (email TEXT PRIMARY KEY, id BIGINT)", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS stock_trader.stocks (ticker TEXT PRIMARY KEY, name TEXT, current_price DOUBLE, last_updated TIMESTAMP)", &[]).await?;
        session.query("CREATE TABLE IF NOT EXISTS stock_trader.history (user_id BIGINT, id BIGINT, email TEXT, ticker TEXT, action TEXT, qty BIGINT, buy_price DOUBLE, sell_price DOUBLE, pl DOUBLE, created_at TIMESTAMP, PRIMARY KEY (user_id, id)) WITH CLUSTERING ORDER BY (id DESC)", &[]).await?;

        info!("Successfully connected to ScyllaDB.");
        Ok(ScyllaStore { session })
    }
}

fn column<'a>(row: &'a Row, idx: usize) -> Option<&'a CqlValue> {
    row.columns.get(idx).and_then(|c| c.as_ref())
}

fn text_at(row: &Row, idx: usize) -> Option<String> {
    column(row, idx).and_then(|v| v.as_text()).cloned()
}

fn bigint_at(row: &Row, idx: usize) -> Option<i64> {
    column(row, idx).and_then(|v| v.as_bigint())
}

fn decimal_at(row: &Row, idx: usize) -> Option<Decimal> {
    column(row, idx)
        .and_then(|v| v.as_double())
        .and_then(Decimal::from_f64)
        .map(crate::models::round2)
}

fn timestamp_at(row: &Row, idx: usize) -> Option<DateTime<Utc>> {
    column(row, idx).and_then(|v| match v {
        CqlValue::Timestamp(ts) => DateTime::<Utc>::from_timestamp_millis(ts.num_milliseconds()),
        _ => None,
    })
}

fn to_db_price(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

// SELECT id, name, email, password_hash, subscriptions, holdings, total_pl, created_at
fn user_from_row(row: &Row) -> Result<User, StoreError> {
    let id = bigint_at(row, 0).ok_or_else(|| StoreError::Decode("users.id".to_string()))?;
    let name = text_at(row, 1).ok_or_else(|| StoreError::Decode("users.name".to_string()))?;
    let email = text_at(row, 2).ok_or_else(|| StoreError::Decode("users.email".to_string()))?;
    let password_hash =
        text_at(row, 3).ok_or_else(|| StoreError::Decode("users.password_hash".to_string()))?;
    // Tolerate missing or malformed JSON columns the way the service always
    // has: fall back to an empty portfolio.
    let subscriptions: BTreeSet<String> = text_at(row, 4)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let holdings: BTreeMap<String, Position> = text_at(row, 5)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let total_pl = decimal_at(row, 6).unwrap_or_default();
    let created_at = timestamp_at(row, 7).unwrap_or_default();
    Ok(User {
        id,
        name,
        email,
        password_hash,
        subscriptions,
        holdings,
        total_pl,
        created_at,
    })
}

// SELECT ticker, name, current_price, last_updated
fn stock_from_row(row: &Row) -> Result<Stock, StoreError> {
    let ticker = text_at(row, 0).ok_or_else(|| StoreError::Decode("stocks.ticker".to_string()))?;
    let name = text_at(row, 1).ok_or_else(|| StoreError::Decode("stocks.name".to_string()))?;
    let current_price =
        decimal_at(row, 2).ok_or_else(|| StoreError::Decode("stocks.current_price".to_string()))?;
    let last_updated = timestamp_at(row, 3).unwrap_or_default();
    Ok(Stock {
        ticker,
        name,
        current_price,
        last_updated,
    })
}

// SELECT id, user_id, email, ticker, action, qty, buy_price, sell_price, pl, created_at
fn history_from_row(row: &Row) -> Result<HistoryEntry, StoreError> {
    let id = bigint_at(row, 0).ok_or_else(|| StoreError::Decode("history.id".to_string()))?;
    let user_id =
        bigint_at(row, 1).ok_or_else(|| StoreError::Decode("history.user_id".to_string()))?;
    let email = text_at(row, 2).ok_or_else(|| StoreError::Decode("history.email".to_string()))?;
    let ticker = text_at(row, 3).ok_or_else(|| StoreError::Decode("history.ticker".to_string()))?;
    let action = match text_at(row, 4).as_deref() {
        Some("BUY") => TradeAction::Buy,
        Some("SELL") => TradeAction::Sell,
        other => {
            return Err(StoreError::Decode(format!(
                "history.action: {:?}",
                other
            )))
        }
    };
    let qty = bigint_at(row, 5).ok_or_else(|| StoreError::Decode("history.qty".to_string()))?;
    let buy_price =
        decimal_at(row, 6).ok_or_else(|| StoreError::Decode("history.buy_price".to_string()))?;
    let sell_price = decimal_at(row, 7);
    let pl = decimal_at(row, 8);
    let created_at = timestamp_at(row, 9).unwrap_or_default();
    Ok(HistoryEntry {
        id,
        user_id,
        email,
        ticker,
        action,
        qty,
        buy_price,
        sell_price,
        pl,
        created_at,
    })
}

#[async_trait]
impl Store for ScyllaStore {
    async fn create_user(&self, user: &User) -> Result<bool, StoreError> {
        // The email table is the uniqueness gate: a lightweight transaction
        // reserves the address before the user row is written.
        let reserve =
            Query::new("INSERT INTO stock_trader.users_by_email (email, id) VALUES (?, ?) IF NOT EXISTS");
        let result = self
            .session
            .query(reserve, (user.email.as_str(), user.id))
            .await?;
        let applied = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|row| row.columns.into_iter().next().flatten())
            .map(|v| matches!(v, CqlValue::Boolean(true)))
            .unwrap_or(false);
        if !applied {
            return Ok(false);
        }

        let insert = Query::new("INSERT INTO stock_trader.users (id, name, email, password_hash, subscriptions, holdings, total_pl, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        self.session
            .query(
                insert,
                (
                    user.id,
                    user.name.as_str(),
                    user.email.as_str(),
                    user.password_hash.as_str(),
                    serde_json::to_string(&user.subscriptions)?,
                    serde_json::to_string(&user.holdings)?,
                    to_db_price(user.total_pl),
                    user.created_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(true)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let query = Query::new("SELECT id, name, email, password_hash, subscriptions, holdings, total_pl, created_at FROM stock_trader.users WHERE id = ?");
        match self
            .session
            .query(query, (id,))
            .await?
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
        {
            Some(row) => Ok(Some(user_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let query = Query::new("SELECT id FROM stock_trader.users_by_email WHERE email = ?");
        let id = self
            .session
            .query(query, (email,))
            .await?
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|row| bigint_at(&row, 0));
        match id {
            Some(id) => self.user_by_id(id).await,
            None => Ok(None),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let query = Query::new("SELECT id, name, email, password_hash, subscriptions, holdings, total_pl, created_at FROM stock_trader.users");
        let rows = self.session.query(query, &[]).await?.rows.unwrap_or_default();
        let users = rows
            .into_iter()
            .filter_map(|row| match user_from_row(&row) {
                Ok(user) => Some(user),
                Err(e) => {
                    error!("Skipping malformed user row: {}", e);
                    None
                }
            })
            .collect();
        Ok(users)
    }

    async fn update_holdings(
        &self,
        user_id: i64,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError> {
        let query = Query::new("UPDATE stock_trader.users SET holdings = ? WHERE id = ?");
        self.session
            .query(query, (serde_json::to_string(holdings)?, user_id))
            .await?;
        Ok(())
    }

    async fn update_portfolio(
        &self,
        user_id: i64,
        subscriptions: &BTreeSet<String>,
        holdings: &BTreeMap<String, Position>,
    ) -> Result<(), StoreError> {
        let query =
            Query::new("UPDATE stock_trader.users SET subscriptions = ?, holdings = ? WHERE id = ?");
        self.session
            .query(
                query,
                (
                    serde_json::to_string(subscriptions)?,
                    serde_json::to_string(holdings)?,
                    user_id,
                ),
            )
            .await?;
        Ok(())
    }

    async fn update_total_pl(&self, user_id: i64, total_pl: Decimal) -> Result<(), StoreError> {
        let query = Query::new("UPDATE stock_trader.users SET total_pl = ? WHERE id = ?");
        self.session
            .query(query, (to_db_price(total_pl), user_id))
            .await?;
        Ok(())
    }

    async fn upsert_stock(&self, stock: &Stock) -> Result<(), StoreError> {
        let query = Query::new("INSERT INTO stock_trader.stocks (ticker, name, current_price, last_updated) VALUES (?, ?, ?, ?)");
        self.session
            .query(
                query,
                (
                    stock.ticker.as_str(),
                    stock.name.as_str(),
                    to_db_price(stock.current_price),
                    stock.last_updated.timestamp_millis(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn stock(&self, ticker: &str) -> Result<Option<Stock>, StoreError> {
        let query = Query::new("SELECT ticker, name, current_price, last_updated FROM stock_trader.stocks WHERE ticker = ?");
        match self
            .session
            .query(query, (ticker,))
            .await?
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
        {
            Some(row) => Ok(Some(stock_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_stocks(&self) -> Result<Vec<Stock>, StoreError> {
        let query = Query::new(
            "SELECT ticker, name, current_price, last_updated FROM stock_trader.stocks",
        );
        let rows = self.session.query(query, &[]).await?.rows.unwrap_or_default();
        let stocks = rows
            .into_iter()
            .filter_map(|row| match stock_from_row(&row) {
                Ok(stock) => Some(stock),
                Err(e) => {
                    error!("Skipping malformed stock row: {}", e);
                    None
                }
            })
            .collect();
        Ok(stocks)
    }

    async fn update_stock_price(
        &self,
        ticker: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = Query::new(
            "UPDATE stock_trader.stocks SET current_price = ?, last_updated = ? WHERE ticker = ?",
        );
        self.session
            .query(query, (to_db_price(price), at.timestamp_millis(), ticker))
            .await?;
        Ok(())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        match (entry.sell_price, entry.pl) {
            (Some(sell_price), Some(pl)) => {
                let query = Query::new("INSERT INTO stock_trader.history (user_id, id, email, ticker, action, qty, buy_price, sell_price, pl, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
                self.session
                    .query(
                        query,
                        (
                            entry.user_id,
                            entry.id,
                            entry.email.as_str(),
                            entry.ticker.as_str(),
                            entry.action.as_str(),
                            entry.qty,
                            to_db_price(entry.buy_price),
                            to_db_price(sell_price),
                            to_db_price(pl),
                            entry.created_at.timestamp_millis(),
                        ),
                    )
                    .await?;
            }
            _ => {
                let query = Query::new("INSERT INTO stock_trader.history (user_id, id, email, ticker, action, qty, buy_price, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
                self.session
                    .query(
                        query,
                        (
                            entry.user_id,
                            entry.id,
                            entry.email.as_str(),
                            entry.ticker.as_str(),
                            entry.action.as_str(),
                            entry.qty,
                            to_db_price(entry.buy_price),
                            entry.created_at.timestamp_millis(),
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn history_for_user(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        // Clustering order on the table already returns newest entries first.
        let query = Query::new("SELECT id, user_id, email, ticker, action, qty, buy_price, sell_price, pl, created_at FROM stock_trader.history WHERE user_id = ?");
        let rows = self
            .session
            .query(query, (user_id,))
            .await?
            .rows
            .unwrap_or_default();
        let entries = rows
            .into_iter()
            .filter_map(|row| match history_from_row(&row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!("Skipping malformed history row: {}", e);
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    async fn max_user_id(&self) -> Result<i64, StoreError> {
        let query = Query::new("SELECT MAX(id) FROM stock_trader.users");
        let max = self
            .session
            .query(query, &[])
            .await?
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|row| bigint_at(&row, 0))
            .unwrap_or(0);
        Ok(max)
    }

    async fn max_history_id(&self) -> Result<i64, StoreError> {
        let query = Query::new("SELECT MAX(id) FROM stock_trader.history");
        let max = self
            .session
            .query(query, &[])
            .await?
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|row| bigint_at(&row, 0))
            .unwrap_or(0);
        Ok(max)
    }
}
