// src/auth.rs
use crate::config::Config;
use crate::error::AppError;
use crate::models::{User, UserView};
use crate::store::Store;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub exp: usize,
}

/// Identity extracted from a validated token. Trusted downstream.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
    pub name: String,
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("password hash failed: {}", e)))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let parsed = match PasswordHash::new(stored) {
        Ok(v) => v,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn decode_token(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))?;
    let Claims { id, email, name, .. } = data.claims;
    Ok(AuthUser { id, email, name })
}

/// Registration, login and token validation. User ids are handed out from an
/// in-process counter seeded with the store's current maximum.
#[derive(Clone)]
pub struct Identity {
    store: Arc<dyn Store>,
    next_user_id: Arc<AtomicI64>,
    secret: Arc<String>,
    token_expiry_hours: i64,
}

impl Identity {
    pub fn new(store: Arc<dyn Store>, config: &Config, last_user_id: i64) -> Identity {
        Identity {
            store,
            next_user_id: Arc::new(AtomicI64::new(last_user_id)),
            secret: Arc::new(config.jwt_secret.clone()),
            token_expiry_hours: config.token_expiry_hours,
        }
    }

    fn issue_token(&self, user: &User) -> Result<String, AppError> {
        let exp = (Utc::now() + chrono::Duration::hours(self.token_expiry_hours)).timestamp();
        let claims = Claims {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            exp: exp as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("token encode failed: {}", e)))
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<(UserView, String), AppError> {
        let password_hash = hash_password(password)?;
        let user = User {
            id: self.next_user_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            email: email.to_string(),
            password_hash,
            subscriptions: BTreeSet::new(),
            holdings: BTreeMap::new(),
            total_pl: Decimal::ZERO,
            created_at: Utc::now(),
        };
        if !self.store.create_user(&user).await? {
            return Err(AppError::EmailTaken);
        }
        let token = self.issue_token(&user)?;
        Ok((user.view(), token))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(UserView, String), AppError> {
        let user = match self.store.user_by_email(email).await? {
            Some(user) => user,
            None => return Err(AppError::Unauthorized("Invalid credentials".to_string())),
        };
        if !verify_password(&user.password_hash, password) {
            return Err(AppError::Unauthorized("Invalid credentials".to_string()));
        }
        let token = self.issue_token(&user)?;
        Ok((user.view(), token))
    }

    pub async fn me(&self, id: i64) -> Result<UserView, AppError> {
        match self.store.user_by_id(id).await? {
            Some(user) => Ok(user.view()),
            None => Err(AppError::UserNotFound),
        }
    }

    /// Validates the `Authorization: Bearer <token>` header.
    pub fn authorize(&self, header: Option<&str>) -> Result<AuthUser, AppError> {
        match header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) => decode_token(token, &self.secret),
            None => Err(AppError::Unauthorized("Missing token".to_string())),
        }
    }
}
