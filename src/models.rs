// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Rounds a money amount to 2 decimal places, halves away from zero.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One open holding: how many units and the weighted average paid per unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub qty: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_buy: Decimal,
}

/// Full user record as stored. Never serialized to clients; see [`UserView`].
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub subscriptions: BTreeSet<String>,
    pub holdings: BTreeMap<String, Position>,
    pub total_pl: Decimal,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn view(&self) -> UserView {
        UserView {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            subscriptions: self.subscriptions.clone(),
            holdings: self.holdings.clone(),
            total_pl: self.total_pl,
            created_at: self.created_at,
        }
    }
}

/// Client-facing user snapshot, also carried in `user_update` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub subscriptions: BTreeSet<String>,
    pub holdings: BTreeMap<String, Position>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_pl: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub ticker: String,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub current_price: Decimal,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

/// Immutable record of a realized trade event. `sell_price` and `pl` are
/// absent on BUY entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    pub ticker: String,
    pub action: TradeAction,
    pub qty: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub buy_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub sell_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub pl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}
