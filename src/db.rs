// src/db.rs
use crate::error::AppError;
use crate::models::{Holding, Quote, Transaction, User};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction as SqlTransaction};
use std::path::Path;
use std::str::FromStr;
use warp::http::StatusCode;

pub type DbPool = SqlitePool;

/// Opens the SQLite file behind `database_url`, creating it and its parent
/// directory when missing, and applies the schema.
pub async fn init(database_url: &str) -> Result<DbPool, sqlx::Error> {
    if let Some(path) = database_url
        .strip_prefix("sqlite://")
        .filter(|path| !path.starts_with(':'))
    {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!("Connected to database {}", database_url);
    Ok(pool)
}

pub async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL,
            cash REAL NOT NULL DEFAULT 10000.00
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stocks (
            username TEXT NOT NULL,
            symbol TEXT NOT NULL,
            stock_name TEXT NOT NULL,
            price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            PRIMARY KEY (username, symbol)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            symbol TEXT NOT NULL,
            stock_name TEXT NOT NULL,
            price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            transacted DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS history_username ON history (username)")
        .execute(pool)
        .await?;

    debug!("Schema ready");
    Ok(())
}

pub async fn find_user_by_id(pool: &DbPool, user_id: i64) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>("SELECT id, username, hash, cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn find_user_by_name(pool: &DbPool, username: &str) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, hash, cash FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Inserts a user holding `cash`. Returns `None` if the username is taken.
pub async fn create_user(
    pool: &DbPool,
    username: &str,
    hash: &str,
    cash: f64,
) -> Result<Option<i64>, AppError> {
    let result = sqlx::query("INSERT INTO users (username, hash, cash) VALUES (?, ?, ?)")
        .bind(username)
        .bind(hash)
        .bind(cash)
        .execute(pool)
        .await;

    match result {
        Ok(done) => Ok(Some(done.last_insert_rowid())),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn update_password(pool: &DbPool, user_id: i64, hash: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE users SET hash = ? WHERE id = ?")
        .bind(hash)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn holdings(pool: &DbPool, username: &str) -> Result<Vec<Holding>, AppError> {
    let rows = sqlx::query_as::<_, Holding>(
        "SELECT username, symbol, stock_name, price, quantity FROM stocks
         WHERE username = ? ORDER BY symbol",
    )
    .bind(username)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn holding(
    pool: &DbPool,
    username: &str,
    symbol: &str,
) -> Result<Option<Holding>, AppError> {
    let row = sqlx::query_as::<_, Holding>(
        "SELECT username, symbol, stock_name, price, quantity FROM stocks
         WHERE username = ? AND symbol = ?",
    )
    .bind(username)
    .bind(symbol)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn history(pool: &DbPool, username: &str) -> Result<Vec<Transaction>, AppError> {
    let rows = sqlx::query_as::<_, Transaction>(
        "SELECT id, username, symbol, stock_name, price, quantity, transacted FROM history
         WHERE username = ? ORDER BY id",
    )
    .bind(username)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn cash_of(tx: &mut SqlTransaction<'_, Sqlite>, user_id: i64) -> Result<f64, AppError> {
    let cash: Option<f64> = sqlx::query_scalar("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
    cash.ok_or(AppError::Unauthorized)
}

async fn append_history(
    tx: &mut SqlTransaction<'_, Sqlite>,
    username: &str,
    quote: &Quote,
    quantity: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO history (username, symbol, stock_name, price, quantity)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(&quote.symbol)
    .bind(&quote.name)
    .bind(quote.price)
    .bind(quantity)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Debits the cost of `shares` at the quoted price, adds them to the
/// holding and logs the trade, all in one transaction. Returns the new cash
/// balance.
///
/// The guarded debit is the first statement so the transaction holds the
/// write lock before it reads anything; concurrent trades wait on the busy
/// timeout instead of failing.
pub async fn buy(
    pool: &DbPool,
    user: &User,
    quote: &Quote,
    shares: i64,
) -> Result<f64, AppError> {
    let mut tx = pool.begin().await?;

    let cost = quote.price * shares as f64;
    let balance: Option<f64> = sqlx::query_scalar(
        "UPDATE users SET cash = cash - ?1 WHERE id = ?2 AND cash >= ?1 RETURNING cash",
    )
    .bind(cost)
    .bind(user.id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(balance) = balance else {
        // Distinguishes a vanished account from a short balance.
        cash_of(&mut tx, user.id).await?;
        return Err(AppError::with_status("insufficient funds", StatusCode::BAD_REQUEST));
    };

    sqlx::query(
        "INSERT INTO stocks (username, symbol, stock_name, price, quantity)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (username, symbol) DO UPDATE SET quantity = quantity + excluded.quantity",
    )
    .bind(&user.username)
    .bind(&quote.symbol)
    .bind(&quote.name)
    .bind(quote.price)
    .bind(shares)
    .execute(&mut *tx)
    .await?;

    append_history(&mut tx, &user.username, quote, shares).await?;
    tx.commit().await?;

    info!(
        "{} bought {} {} at {:.2}",
        user.username, shares, quote.symbol, quote.price
    );
    Ok(balance)
}

/// Takes `shares` off the user's holding of the quoted symbol, removing it at
/// zero, credits the proceeds and logs the trade with a negative quantity.
/// Returns the new cash balance.
///
/// Like `buy`, the guarded write comes first.
pub async fn sell(
    pool: &DbPool,
    user: &User,
    quote: &Quote,
    shares: i64,
) -> Result<f64, AppError> {
    let mut tx = pool.begin().await?;

    let remaining: Option<i64> = sqlx::query_scalar(
        "UPDATE stocks SET quantity = quantity - ?1
         WHERE username = ?2 AND symbol = ?3 AND quantity >= ?1
         RETURNING quantity",
    )
    .bind(shares)
    .bind(&user.username)
    .bind(&quote.symbol)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(remaining) = remaining else {
        let owned: Option<i64> =
            sqlx::query_scalar("SELECT quantity FROM stocks WHERE username = ? AND symbol = ?")
                .bind(&user.username)
                .bind(&quote.symbol)
                .fetch_optional(&mut *tx)
                .await?;
        return Err(match owned {
            Some(_) => AppError::apology("you're trying to sell more shares than you own"),
            None => AppError::apology("you don't own any shares of that symbol"),
        });
    };

    if remaining == 0 {
        sqlx::query("DELETE FROM stocks WHERE username = ? AND symbol = ?")
            .bind(&user.username)
            .bind(&quote.symbol)
            .execute(&mut *tx)
            .await?;
    }

    let balance: Option<f64> =
        sqlx::query_scalar("UPDATE users SET cash = cash + ? WHERE id = ? RETURNING cash")
            .bind(quote.price * shares as f64)
            .bind(user.id)
            .fetch_optional(&mut *tx)
            .await?;
    let balance = balance.ok_or(AppError::Unauthorized)?;

    append_history(&mut tx, &user.username, quote, -shares).await?;
    tx.commit().await?;

    info!(
        "{} sold {} {} at {:.2}",
        user.username, shares, quote.symbol, quote.price
    );
    Ok(balance)
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> DbPool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(symbol: &str, price: f64) -> Quote {
        Quote {
            name: format!("{} Corp", symbol),
            symbol: symbol.to_string(),
            price,
        }
    }

    async fn user(pool: &DbPool, name: &str) -> User {
        let id = create_user(pool, name, "hash", 10_000.0).await.unwrap().unwrap();
        find_user_by_id(pool, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn new_users_start_with_default_cash() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;
        assert_eq!(alice.cash, 10_000.0);
        assert!(find_user_by_name(&pool, "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_username_is_refused() {
        let pool = memory_pool().await;
        user(&pool, "alice").await;
        assert!(create_user(&pool, "alice", "other", 10_000.0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buying_twice_accumulates_one_holding() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;

        buy(&pool, &alice, &quote("AAPL", 100.0), 3).await.unwrap();
        let cash = buy(&pool, &alice, &quote("AAPL", 110.0), 2).await.unwrap();

        assert_eq!(cash, 10_000.0 - 300.0 - 220.0);
        let held = holdings(&pool, "alice").await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].quantity, 5);
        assert_eq!(held[0].price, 100.0);

        let log = history(&pool, "alice").await.unwrap();
        assert_eq!(log.iter().map(|t| t.quantity).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn unaffordable_buy_changes_nothing() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;

        let err = buy(&pool, &alice, &quote("BRK.A", 600_000.0), 1)
            .await
            .unwrap_err();
        match err {
            AppError::Apology { message, status } => {
                assert_eq!(message, "insufficient funds");
                assert_eq!(status, StatusCode::BAD_REQUEST);
            }
            other => panic!("unexpected error: {other}"),
        }

        let alice = find_user_by_id(&pool, alice.id).await.unwrap().unwrap();
        assert_eq!(alice.cash, 10_000.0);
        assert!(holdings(&pool, "alice").await.unwrap().is_empty());
        assert!(history(&pool, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn selling_everything_removes_the_holding() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;

        buy(&pool, &alice, &quote("MSFT", 200.0), 4).await.unwrap();
        sell(&pool, &alice, &quote("MSFT", 250.0), 1).await.unwrap();
        assert_eq!(holding(&pool, "alice", "MSFT").await.unwrap().unwrap().quantity, 3);

        let cash = sell(&pool, &alice, &quote("MSFT", 250.0), 3).await.unwrap();
        assert_eq!(cash, 10_000.0 - 800.0 + 1_000.0);
        assert!(holding(&pool, "alice", "MSFT").await.unwrap().is_none());

        let quantities: Vec<i64> = history(&pool, "alice")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.quantity)
            .collect();
        assert_eq!(quantities, vec![4, -1, -3]);
    }

    #[tokio::test]
    async fn overselling_is_refused() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;
        buy(&pool, &alice, &quote("MSFT", 200.0), 2).await.unwrap();

        let err = sell(&pool, &alice, &quote("MSFT", 200.0), 3).await.unwrap_err();
        assert_eq!(err.to_string(), "you're trying to sell more shares than you own");
        assert_eq!(holding(&pool, "alice", "MSFT").await.unwrap().unwrap().quantity, 2);

        let err = sell(&pool, &alice, &quote("TSLA", 200.0), 1).await.unwrap_err();
        assert_eq!(err.to_string(), "you don't own any shares of that symbol");
    }

    #[tokio::test]
    async fn holdings_are_per_user() {
        let pool = memory_pool().await;
        let alice = user(&pool, "alice").await;
        let bob = user(&pool, "bob").await;

        buy(&pool, &alice, &quote("AAPL", 10.0), 1).await.unwrap();
        buy(&pool, &bob, &quote("AAPL", 10.0), 7).await.unwrap();

        assert_eq!(holding(&pool, "alice", "AAPL").await.unwrap().unwrap().quantity, 1);
        assert_eq!(holding(&pool, "bob", "AAPL").await.unwrap().unwrap().quantity, 7);
    }

    #[tokio::test]
    async fn file_database_is_created_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("finance.db");
        let url = format!("sqlite://{}", path.display());

        let pool = init(&url).await.unwrap();
        let id = create_user(&pool, "carol", "hash", 500.0).await.unwrap().unwrap();
        let carol = find_user_by_id(&pool, id).await.unwrap().unwrap();

        assert!(path.exists());
        assert_eq!(carol.cash, 500.0);
    }

    #[tokio::test]
    async fn starting_cash_applies_per_registration() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("finance.db").display());

        let pool = init(&url).await.unwrap();
        let first = create_user(&pool, "early", "hash", 10_000.0).await.unwrap().unwrap();
        pool.close().await;

        // Reopening an existing file with a different setting.
        let pool = init(&url).await.unwrap();
        let second = create_user(&pool, "late", "hash", 2_500.0).await.unwrap().unwrap();

        assert_eq!(find_user_by_id(&pool, first).await.unwrap().unwrap().cash, 10_000.0);
        assert_eq!(find_user_by_id(&pool, second).await.unwrap().unwrap().cash, 2_500.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_buys_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("finance.db").display());
        let pool = init(&url).await.unwrap();
        let dana = user(&pool, "dana").await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                let dana = dana.clone();
                tokio::spawn(async move { buy(&pool, &dana, &quote("AAPL", 1.0), 1).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let dana = find_user_by_id(&pool, dana.id).await.unwrap().unwrap();
        assert_eq!(dana.cash, 10_000.0 - 20.0);
        assert_eq!(holding(&pool, "dana", "AAPL").await.unwrap().unwrap().quantity, 20);
        assert_eq!(history(&pool, "dana").await.unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_sells_never_oversell() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("finance.db").display());
        let pool = init(&url).await.unwrap();
        let eli = user(&pool, "eli").await;
        buy(&pool, &eli, &quote("MSFT", 10.0), 5).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let eli = eli.clone();
                tokio::spawn(async move { sell(&pool, &eli, &quote("MSFT", 10.0), 1).await })
            })
            .collect();

        let mut sold = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => sold += 1,
                Err(AppError::Apology { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(sold, 5);
        assert!(holding(&pool, "eli", "MSFT").await.unwrap().is_none());
        let eli = find_user_by_id(&pool, eli.id).await.unwrap().unwrap();
        assert_eq!(eli.cash, 10_000.0);
    }
}
