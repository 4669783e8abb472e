// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod lookup;
mod models;

use crate::api::AppState;
use crate::config::Config;
use crate::lookup::AlphaVantage;
use env_logger::{Builder, Env};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match db::init(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let quotes = match AlphaVantage::new(config.api_key.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build quote client: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting the stock trading simulator...");
    let state = Arc::new(AppState {
        pool,
        quotes,
        session_secret: config.session_secret,
        bcrypt_cost: config.bcrypt_cost,
        starting_cash: config.starting_cash,
    });

    info!("Server running on http://{}", config.bind_addr);
    warp::serve(api::app(state)).run(config.bind_addr).await;
}
