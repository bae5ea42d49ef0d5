// src/error.rs
use crate::store::StoreError;
use log::error;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("Ticker not supported")]
    TickerNotFound,
    #[error("Stock not held")]
    HoldingNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Email already exists")]
    EmailTaken,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl Reject for AppError {}

/// Maps rejections to the `{"ok": false, "error": ...}` envelope. Storage and
/// internal failures are logged in full and reported as a generic 500.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(app_err) = err.find::<AppError>() {
        match app_err {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, app_err.to_string()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, app_err.to_string()),
            AppError::TickerNotFound | AppError::HoldingNotFound | AppError::UserNotFound => {
                (StatusCode::NOT_FOUND, app_err.to_string())
            }
            AppError::EmailTaken => (StatusCode::CONFLICT, app_err.to_string()),
            AppError::Storage(_) | AppError::Internal(_) => {
                error!("request failed: {}", app_err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
            }
        }
    } else if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "Invalid request body".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else {
        error!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
    };

    let body = warp::reply::json(&json!({"ok": false, "error": message}));
    Ok(warp::reply::with_status(body, status))
}
