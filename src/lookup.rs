// src/lookup.rs
use crate::models::Quote;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("provider rate limit: {0}")]
    RateLimited(String),
    #[error("malformed price {0:?}")]
    BadPrice(String),
}

/// Source of live share prices.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Returns `None` when the provider knows no such symbol.
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError>;
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote", default)]
    quote: Option<GlobalQuote>,
    #[serde(rename = "Note", default)]
    note: Option<String>,
    #[serde(rename = "Information", default)]
    information: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol", default)]
    symbol: Option<String>,
    #[serde(rename = "05. price", default)]
    price: Option<String>,
}

#[derive(Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SymbolMatch>,
}

#[derive(Deserialize)]
struct SymbolMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
}

#[derive(Clone)]
pub struct AlphaVantage {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantage {
    pub fn new(api_key: impl Into<String>) -> Result<Self, QuoteError> {
        Self::with_base_url(api_key, ALPHA_VANTAGE_URL)
    }

    /// Client for an Alpha Vantage compatible endpoint at `base_url`.
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, QuoteError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(AlphaVantage {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        })
    }

    async fn query<T: for<'de> Deserialize<'de>>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, QuoteError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QuoteError::Status(response.status()));
        }
        Ok(response.json::<T>().await?)
    }

    /// Company name for `symbol`; the symbol itself when the search has no
    /// exact match or fails.
    async fn company_name(&self, symbol: &str) -> String {
        let search = self
            .query::<SymbolSearchResponse>(&[("function", "SYMBOL_SEARCH"), ("keywords", symbol)])
            .await;

        match search {
            Ok(found) => found
                .best_matches
                .into_iter()
                .find(|m| m.symbol.eq_ignore_ascii_case(symbol))
                .map(|m| m.name)
                .unwrap_or_else(|| symbol.to_string()),
            Err(e) => {
                warn!("Name lookup for {} failed: {}", symbol, e);
                symbol.to_string()
            }
        }
    }
}

#[async_trait]
impl QuoteSource for AlphaVantage {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Ok(None);
        }

        let response: GlobalQuoteResponse = self
            .query(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol.as_str())])
            .await?;

        let Some((symbol, price)) = parse_global_quote(response)? else {
            info!("No quote found for {}", symbol);
            return Ok(None);
        };

        let name = self.company_name(&symbol).await;
        info!("Quoted {} at {}", symbol, price);
        Ok(Some(Quote {
            name,
            symbol,
            price,
        }))
    }
}

/// Extracts symbol and price; an empty `Global Quote` object means the
/// symbol is unknown.
fn parse_global_quote(response: GlobalQuoteResponse) -> Result<Option<(String, f64)>, QuoteError> {
    if let Some(note) = response.note.or(response.information) {
        return Err(QuoteError::RateLimited(note));
    }

    let Some(quote) = response.quote else {
        return Ok(None);
    };
    let (Some(symbol), Some(raw_price)) = (quote.symbol, quote.price) else {
        return Ok(None);
    };

    let price: f64 = raw_price
        .trim()
        .parse()
        .map_err(|_| QuoteError::BadPrice(raw_price.clone()))?;
    Ok(Some((symbol, price)))
}
