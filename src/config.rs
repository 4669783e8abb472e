// src/config.rs
use log::warn;
use std::env;
use std::net::SocketAddr;

const DEFAULT_DATABASE_URL: &str = "sqlite://finance.db";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3030";
const DEV_SESSION_SECRET: &str = "development-session-secret";
pub const DEFAULT_STARTING_CASH: f64 = 10_000.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_KEY not set")]
    MissingApiKey,
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub session_secret: String,
    pub starting_cash: f64,
    pub bcrypt_cost: u32,
}

impl Config {
    /// Reads settings from the process environment. A `.env` file in the
    /// working directory is loaded first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let bind_addr: SocketAddr = parse_or("BIND_ADDR", &lookup, DEFAULT_BIND_ADDR.parse().ok())?;

        let session_secret = match lookup("SESSION_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("SESSION_SECRET not set, falling back to the development secret");
                DEV_SESSION_SECRET.to_string()
            }
        };

        let starting_cash = parse_or("STARTING_CASH", &lookup, Some(DEFAULT_STARTING_CASH))?;
        let bcrypt_cost = parse_or("BCRYPT_COST", &lookup, Some(bcrypt::DEFAULT_COST))?;

        Ok(Config {
            api_key,
            database_url,
            bind_addr,
            session_secret,
            starting_cash,
            bcrypt_cost,
        })
    }
}

fn parse_or<T, F>(name: &'static str, lookup: &F, default: Option<T>) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => default.ok_or(ConfigError::Invalid {
            name,
            value: String::new(),
        }),
    }
}
