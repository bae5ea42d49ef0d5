// src/config.rs
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Scylla,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<StoreBackend, String> {
        match s.to_ascii_lowercase().as_str() {
            "scylla" => Ok(StoreBackend::Scylla),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub scylla_addr: String,
    pub jwt_secret: String,
    pub token_expiry_hours: i64,
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            store_backend: StoreBackend::Scylla,
            scylla_addr: "127.0.0.1:9042".to_string(),
            jwt_secret: "replace_with_strong_secret".to_string(),
            token_expiry_hours: 8,
            tick_interval: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let defaults = Config::default();
        Config {
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr),
            store_backend: env_or("STORE_BACKEND", defaults.store_backend),
            scylla_addr: env_or("SCYLLA_ADDR", defaults.scylla_addr),
            jwt_secret: env_or("JWT_SECRET", defaults.jwt_secret),
            token_expiry_hours: env_or("TOKEN_EXPIRY_HOURS", defaults.token_expiry_hours),
            tick_interval: Duration::from_millis(env_or("TICK_INTERVAL_MS", 1000)),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_overrides_and_defaults() {
        std::env::set_var("BIND_ADDR", "0.0.0.0:9100");
        std::env::set_var("STORE_BACKEND", "memory");
        std::env::set_var("TICK_INTERVAL_MS", "250");
        std::env::set_var("TOKEN_EXPIRY_HOURS", "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.bind_addr, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        // Unparseable values fall back to the default.
        assert_eq!(config.token_expiry_hours, 8);
        // Unset values fall back too.
        assert_eq!(config.scylla_addr, "127.0.0.1:9042");

        std::env::remove_var("BIND_ADDR");
        std::env::remove_var("STORE_BACKEND");
        std::env::remove_var("TICK_INTERVAL_MS");
        std::env::remove_var("TOKEN_EXPIRY_HOURS");
    }
}
