// src/models.rs
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hash: String,
    pub cash: f64,
}

/// A user's position in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Holding {
    pub username: String,
    pub symbol: String,
    pub stock_name: String,
    pub price: f64,
    pub quantity: i64,
}

/// One row of the append-only trade log. Sells carry a negative quantity.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub username: String,
    pub symbol: String,
    pub stock_name: String,
    pub price: f64,
    pub quantity: i64,
    pub transacted: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub name: String,
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Serialize)]
pub struct QuoteView {
    pub name: String,
    pub symbol: String,
    pub price: f64,
    pub price_usd: String,
}

impl From<Quote> for QuoteView {
    fn from(quote: Quote) -> Self {
        QuoteView {
            price_usd: usd(quote.price),
            name: quote.name,
            symbol: quote.symbol,
            price: quote.price,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HoldingView {
    pub symbol: String,
    pub stock_name: String,
    pub quantity: i64,
    pub current_price: f64,
    pub value: f64,
    pub current_price_usd: String,
    pub value_usd: String,
}

#[derive(Debug, Serialize)]
pub struct PortfolioView {
    pub username: String,
    pub stocks: Vec<HoldingView>,
    pub cash: f64,
    pub total: f64,
    pub cash_usd: String,
    pub total_usd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash: Option<String>,
}

impl PortfolioView {
    /// Values each holding at its current price and totals the account.
    pub fn build(
        username: String,
        cash: f64,
        priced: Vec<(Holding, f64)>,
        flash: Option<String>,
    ) -> Self {
        let mut total = cash;
        let stocks = priced
            .into_iter()
            .map(|(holding, current_price)| {
                let value = holding.quantity as f64 * current_price;
                total += value;
                HoldingView {
                    symbol: holding.symbol,
                    stock_name: holding.stock_name,
                    quantity: holding.quantity,
                    current_price,
                    value,
                    current_price_usd: usd(current_price),
                    value_usd: usd(value),
                }
            })
            .collect();

        PortfolioView {
            username,
            stocks,
            cash,
            total,
            cash_usd: usd(cash),
            total_usd: usd(total),
            flash,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryView {
    pub history: Vec<Transaction>,
}

#[derive(Debug, Serialize)]
pub struct SellView {
    pub symbols: Vec<String>,
}

/// Formats a dollar amount as `$1,234.56`.
pub fn usd(value: f64) -> String {
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}
