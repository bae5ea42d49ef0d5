// src/api.rs
use crate::auth::{AuthUser, Identity};
use crate::error::{handle_rejection, AppError};
use crate::ledger::Ledger;
use crate::oracle::Oracle;
use crate::ws::Broadcaster;
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use warp::{Filter, Rejection, Reply};

#[derive(Deserialize)]
struct SignupRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct TradeRequest {
    #[serde(default)]
    ticker: String,
    #[serde(default = "default_qty")]
    qty: i64,
}

fn default_qty() -> i64 {
    1
}

#[derive(Deserialize)]
struct TickerRequest {
    #[serde(default)]
    ticker: String,
}

pub fn routes(
    identity: Identity,
    ledger: Ledger,
    oracle: Oracle,
    events: Broadcaster,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let signup = warp::path("signup")
        .and(warp::post())
        .and(with_identity(identity.clone()))
        .and(warp::body::json())
        .and_then(signup_handler);

    let login = warp::path("login")
        .and(warp::post())
        .and(with_identity(identity.clone()))
        .and(warp::body::json())
        .and_then(login_handler);

    let me = warp::path("me")
        .and(warp::get())
        .and(with_auth(identity.clone()))
        .and(with_identity(identity.clone()))
        .and_then(me_handler);

    let stocks = warp::path("stocks")
        .and(warp::get())
        .and(with_oracle(oracle))
        .and_then(stocks_handler);

    let buy = warp::path("buy")
        .and(warp::post())
        .and(with_auth(identity.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(buy_handler);

    let sell = warp::path("sell")
        .and(warp::post())
        .and(with_auth(identity.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(sell_handler);

    let subscribe = warp::path("subscribe")
        .and(warp::post())
        .and(with_auth(identity.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(subscribe_handler);

    let unsubscribe = warp::path("unsubscribe")
        .and(warp::post())
        .and(with_auth(identity.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(unsubscribe_handler);

    let history = warp::path("history")
        .and(warp::get())
        .and(with_auth(identity))
        .and(with_ledger(ledger))
        .and_then(history_handler);

    let ws = warp::path("ws")
        .and(warp::ws())
        .and(with_events(events))
        .map(|ws: warp::ws::Ws, events: Broadcaster| {
            ws.on_upgrade(move |socket| crate::ws::client_connected(socket, events.subscribe()))
        });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    signup
        .or(login)
        .or(me)
        .or(stocks)
        .or(buy)
        .or(sell)
        .or(subscribe)
        .or(unsubscribe)
        .or(history)
        .or(ws)
        .recover(handle_rejection)
        .with(cors)
}

fn with_identity(
    identity: Identity,
) -> impl Filter<Extract = (Identity,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || identity.clone())
}

fn with_ledger(
    ledger: Ledger,
) -> impl Filter<Extract = (Ledger,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ledger.clone())
}

fn with_oracle(
    oracle: Oracle,
) -> impl Filter<Extract = (Oracle,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || oracle.clone())
}

fn with_events(
    events: Broadcaster,
) -> impl Filter<Extract = (Broadcaster,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || events.clone())
}

/// Turns the `Authorization` header into a trusted [`AuthUser`] or rejects.
fn with_auth(identity: Identity) -> impl Filter<Extract = (AuthUser,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let identity = identity.clone();
        async move {
            identity
                .authorize(header.as_deref())
                .map_err(warp::reject::custom)
        }
    })
}

async fn signup_handler(identity: Identity, req: SignupRequest) -> Result<impl Reply, Rejection> {
    if req.name.is_empty() || req.email.is_empty() || req.password.is_empty() {
        return Err(warp::reject::custom(AppError::BadRequest(
            "name,email,password required".to_string(),
        )));
    }
    match identity.register(&req.name, &req.email, &req.password).await {
        Ok((user, token)) => {
            info!("Registered user {} ({})", user.id, user.email);
            Ok(warp::reply::json(
                &json!({"ok": true, "user": user, "token": token}),
            ))
        }
        Err(e) => {
            error!("Signup failed for {}: {}", req.email, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn login_handler(identity: Identity, req: LoginRequest) -> Result<impl Reply, Rejection> {
    match identity.login(&req.email, &req.password).await {
        Ok((user, token)) => {
            info!("User {} logged in", user.id);
            Ok(warp::reply::json(
                &json!({"ok": true, "user": user, "token": token}),
            ))
        }
        Err(e) => {
            error!("Login failed for {}: {}", req.email, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn me_handler(auth: AuthUser, identity: Identity) -> Result<impl Reply, Rejection> {
    match identity.me(auth.id).await {
        Ok(user) => Ok(warp::reply::json(&json!({"ok": true, "user": user}))),
        Err(e) => {
            error!("Lookup failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn stocks_handler(oracle: Oracle) -> Result<impl Reply, Rejection> {
    match oracle.list().await {
        Ok(stocks) => Ok(warp::reply::json(&json!({"ok": true, "stocks": stocks}))),
        Err(e) => {
            error!("Failed to list stocks: {}", e);
            Err(warp::reject::custom(AppError::from(e)))
        }
    }
}

async fn buy_handler(
    auth: AuthUser,
    ledger: Ledger,
    req: TradeRequest,
) -> Result<impl Reply, Rejection> {
    if req.ticker.is_empty() {
        return Err(warp::reject::custom(AppError::BadRequest(
            "ticker required".to_string(),
        )));
    }
    match ledger.buy(auth.id, &req.ticker, req.qty).await {
        Ok(user) => {
            info!("User {} bought {} x{}", auth.id, req.ticker, req.qty);
            Ok(warp::reply::json(&json!({"ok": true, "user": user})))
        }
        Err(e) => {
            error!("Buy failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn sell_handler(
    auth: AuthUser,
    ledger: Ledger,
    req: TickerRequest,
) -> Result<impl Reply, Rejection> {
    if req.ticker.is_empty() {
        return Err(warp::reject::custom(AppError::BadRequest(
            "ticker required".to_string(),
        )));
    }
    match ledger.sell(auth.id, &req.ticker).await {
        Ok(user) => {
            info!("User {} sold {}", auth.id, req.ticker);
            Ok(warp::reply::json(&json!({"ok": true, "user": user})))
        }
        Err(e) => {
            error!("Sell failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn subscribe_handler(
    auth: AuthUser,
    ledger: Ledger,
    req: TickerRequest,
) -> Result<impl Reply, Rejection> {
    if req.ticker.is_empty() {
        return Err(warp::reject::custom(AppError::BadRequest(
            "ticker required".to_string(),
        )));
    }
    match ledger.subscribe(auth.id, &req.ticker).await {
        Ok(user) => {
            info!("User {} subscribed to {}", auth.id, req.ticker);
            Ok(warp::reply::json(&json!({"ok": true, "user": user})))
        }
        Err(e) => {
            error!("Subscribe failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn unsubscribe_handler(
    auth: AuthUser,
    ledger: Ledger,
    req: TickerRequest,
) -> Result<impl Reply, Rejection> {
    if req.ticker.is_empty() {
        return Err(warp::reject::custom(AppError::BadRequest(
            "ticker required".to_string(),
        )));
    }
    match ledger.unsubscribe(auth.id, &req.ticker).await {
        Ok(user) => {
            info!("User {} unsubscribed from {}", auth.id, req.ticker);
            Ok(warp::reply::json(&json!({"ok": true, "user": user})))
        }
        Err(e) => {
            error!("Unsubscribe failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}

async fn history_handler(auth: AuthUser, ledger: Ledger) -> Result<impl Reply, Rejection> {
    match ledger.history(auth.id).await {
        Ok(history) => Ok(warp::reply::json(&json!({"ok": true, "history": history}))),
        Err(e) => {
            error!("History query failed for user {}: {}", auth.id, e);
            Err(warp::reject::custom(e))
        }
    }
}
