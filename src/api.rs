// src/api.rs
use crate::auth::{self, with_user};
use crate::db::{self, DbPool};
use crate::error::{self, AppError};
use crate::lookup::QuoteSource;
use crate::models::{HistoryView, PortfolioView, Quote, QuoteView, SellView, User};
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use warp::http::{header, Uri};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const FLASH_COOKIE: &str = "flash";
const SELL_PLACEHOLDER: &str = "Symbol";
// Forms are small; anything larger is not a browser submission.
const FORM_LIMIT: u64 = 16 * 1024;

/// Shared state every handler reads from.
pub struct AppState {
    pub pool: DbPool,
    pub quotes: Arc<dyn QuoteSource>,
    pub session_secret: String,
    pub bcrypt_cost: u32,
    pub starting_cash: f64,
}

#[derive(Deserialize)]
struct TradeForm {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    shares: String,
}

#[derive(Deserialize)]
struct QuoteForm {
    #[serde(default)]
    symbol: String,
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct RegisterForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    confirmation: String,
}

#[derive(Deserialize)]
struct AccountForm {
    #[serde(default)]
    old_password: String,
    #[serde(default)]
    new_password: String,
    #[serde(default)]
    new_confirmation: String,
}

/// Every route, with rejections rendered as apologies and caching disabled.
pub fn app(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
    let mut no_cache = header::HeaderMap::new();
    no_cache.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    no_cache.insert(header::EXPIRES, header::HeaderValue::from_static("0"));
    no_cache.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));

    routes(state)
        .recover(error::recover)
        .with(warp::reply::with::headers(no_cache))
        .with(warp::log("stock_trader::http"))
}

pub fn routes(state: Arc<AppState>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and(warp::cookie::optional::<String>(FLASH_COOKIE))
        .and_then(index_handler);

    let buy = warp::path!("buy")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and(form::<TradeForm>())
        .and_then(buy_handler);

    let sell_form = warp::path!("sell")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and_then(sell_form_handler);

    let sell = warp::path!("sell")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and(form::<TradeForm>())
        .and_then(sell_handler);

    let quote = warp::path!("quote")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and(form::<QuoteForm>())
        .and_then(quote_handler);

    let history = warp::path!("history")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(with_user(state.clone()))
        .and_then(history_handler);

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form::<LoginForm>())
        .and_then(login_handler);

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form::<RegisterForm>())
        .and_then(register_handler);

    let logout = warp::path!("logout").and(warp::get()).map(logout_handler);

    let account = warp::path!("account")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_user(state))
        .and(form::<AccountForm>())
        .and_then(account_handler);

    index
        .or(buy)
        .or(sell_form)
        .or(sell)
        .or(quote)
        .or(history)
        .or(login)
        .or(register)
        .or(logout)
        .or(account)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn form<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    warp::body::content_length_limit(FORM_LIMIT).and(warp::body::form())
}

fn flash_cookie(message: &str) -> String {
    format!(
        "{}={}; Path=/; SameSite=Lax",
        FLASH_COOKIE,
        urlencoding::encode(message)
    )
}

fn clear_flash_cookie() -> String {
    format!("{}=; Path=/; SameSite=Lax; Max-Age=0", FLASH_COOKIE)
}

/// 303 to the portfolio with a one-shot message for the next page view.
fn redirect_home(flash: &str) -> Response {
    let reply = warp::redirect::see_other(Uri::from_static("/"));
    warp::reply::with_header(reply, "set-cookie", flash_cookie(flash)).into_response()
}

fn append_cookie(mut response: Response, cookie: String) -> Response {
    if let Ok(value) = header::HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Looks up a quote, treating an unknown symbol as a user error.
async fn require_quote(
    state: &AppState,
    symbol: &str,
    unknown: &'static str,
) -> Result<Quote, AppError> {
    state
        .quotes
        .lookup(symbol)
        .await?
        .ok_or_else(|| AppError::apology(unknown))
}

async fn index_handler(
    state: Arc<AppState>,
    user: User,
    flash: Option<String>,
) -> Result<Response, Rejection> {
    index(&state, user, flash).await.map_err(warp::reject::custom)
}

async fn index(state: &AppState, user: User, flash: Option<String>) -> Result<Response, AppError> {
    let holdings = db::holdings(&state.pool, &user.username).await?;

    let mut priced = Vec::with_capacity(holdings.len());
    for holding in holdings {
        let current = match state.quotes.lookup(&holding.symbol).await {
            Ok(Some(quote)) => quote.price,
            Ok(None) => {
                warn!("No live price for {}, using last recorded", holding.symbol);
                holding.price
            }
            Err(e) => {
                warn!("Price lookup for {} failed: {}", holding.symbol, e);
                holding.price
            }
        };
        priced.push((holding, current));
    }

    let flash = flash
        .filter(|message| !message.is_empty())
        .map(|message| {
            urlencoding::decode(&message)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(message)
        });
    let had_flash = flash.is_some();

    let view = PortfolioView::build(user.username, user.cash, priced, flash);
    let response = warp::reply::json(&view).into_response();
    Ok(if had_flash {
        append_cookie(response, clear_flash_cookie())
    } else {
        response
    })
}

async fn buy_handler(
    state: Arc<AppState>,
    user: User,
    form: TradeForm,
) -> Result<Response, Rejection> {
    buy(&state, user, form).await.map_err(warp::reject::custom)
}

async fn buy(state: &AppState, user: User, form: TradeForm) -> Result<Response, AppError> {
    let symbol = form.symbol.trim().to_ascii_uppercase();

    let shares: i64 = form
        .shares
        .trim()
        .parse()
        .map_err(|_| AppError::apology("must provide a valid quantity of shares to buy"))?;
    if symbol.is_empty() {
        return Err(AppError::apology("must provide a symbol"));
    }
    if shares <= 0 {
        return Err(AppError::apology("must provide a quantity of shares to buy"));
    }

    let quote = require_quote(state, &symbol, "please provide valid symbol").await?;
    db::buy(&state.pool, &user, &quote, shares).await?;
    Ok(redirect_home("Bought!"))
}

async fn sell_form_handler(state: Arc<AppState>, user: User) -> Result<Response, Rejection> {
    let symbols = db::holdings(&state.pool, &user.username)
        .await
        .map_err(warp::reject::custom)?
        .into_iter()
        .map(|holding| holding.symbol)
        .collect();
    Ok(warp::reply::json(&SellView { symbols }).into_response())
}

async fn sell_handler(
    state: Arc<AppState>,
    user: User,
    form: TradeForm,
) -> Result<Response, Rejection> {
    sell(&state, user, form).await.map_err(warp::reject::custom)
}

async fn sell(state: &AppState, user: User, form: TradeForm) -> Result<Response, AppError> {
    let shares = form
        .shares
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|shares| *shares > 0)
        .ok_or_else(|| AppError::apology("please input valid number of shares to sell"))?;

    let symbol = form.symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || symbol.eq_ignore_ascii_case(SELL_PLACEHOLDER) {
        return Err(AppError::apology("please select symbol to sell"));
    }

    // Ownership is checked before any provider call.
    let owned = db::holding(&state.pool, &user.username, &symbol)
        .await?
        .ok_or_else(|| AppError::apology("you don't own any shares of that symbol"))?;
    if owned.quantity < shares {
        return Err(AppError::apology("you're trying to sell more shares than you own"));
    }

    let mut quote = require_quote(state, &symbol, "please provide valid symbol").await?;
    // The holding row is keyed by the symbol as bought.
    quote.symbol = owned.symbol;
    db::sell(&state.pool, &user, &quote, shares).await?;
    Ok(redirect_home("Sold!"))
}

async fn quote_handler(
    state: Arc<AppState>,
    _user: User,
    form: QuoteForm,
) -> Result<Response, Rejection> {
    let symbol = form.symbol.trim();
    if symbol.is_empty() {
        return Err(warp::reject::custom(AppError::apology("must provide a symbol")));
    }

    let quote = require_quote(&state, symbol, "provide a valid symbol")
        .await
        .map_err(warp::reject::custom)?;
    Ok(warp::reply::json(&QuoteView::from(quote)).into_response())
}

async fn history_handler(state: Arc<AppState>, user: User) -> Result<Response, Rejection> {
    let history = db::history(&state.pool, &user.username)
        .await
        .map_err(warp::reject::custom)?;
    Ok(warp::reply::json(&HistoryView { history }).into_response())
}

async fn login_handler(state: Arc<AppState>, form: LoginForm) -> Result<Response, Rejection> {
    match login(&state, form).await {
        Ok(response) => Ok(response),
        // A failed login also ends whatever session the browser had.
        Err(AppError::Apology { message, status }) => Ok(append_cookie(
            error::apology(&message, status),
            auth::clear_session_cookie(),
        )),
        Err(e) => Err(warp::reject::custom(e)),
    }
}

async fn login(state: &AppState, form: LoginForm) -> Result<Response, AppError> {
    if form.username.is_empty() {
        return Err(AppError::apology("must provide username"));
    }
    if form.password.is_empty() {
        return Err(AppError::apology("must provide password"));
    }

    let user = db::find_user_by_name(&state.pool, &form.username).await?;
    let user = match user {
        Some(user) if auth::verify_password(&form.password, &user.hash)? => user,
        _ => {
            warn!("Failed login for {}", form.username);
            return Err(AppError::apology("invalid username and/or password"));
        }
    };

    let token = auth::create_token(user.id, &state.session_secret)?;
    info!("{} logged in", user.username);
    Ok(append_cookie(
        redirect_home("Login Successful!"),
        auth::session_cookie(&token),
    ))
}

async fn register_handler(state: Arc<AppState>, form: RegisterForm) -> Result<Response, Rejection> {
    register(&state, form).await.map_err(warp::reject::custom)
}

async fn register(state: &AppState, form: RegisterForm) -> Result<Response, AppError> {
    if form.username.is_empty() {
        return Err(AppError::apology("must provide username"));
    }
    if form.password.is_empty() {
        return Err(AppError::apology("must provide password"));
    }
    if form.confirmation.is_empty() {
        return Err(AppError::apology("must confirm password"));
    }
    if form.password != form.confirmation {
        return Err(AppError::apology("passwords must match"));
    }
    if db::find_user_by_name(&state.pool, &form.username).await?.is_some() {
        return Err(AppError::apology("username already taken"));
    }

    let hash = auth::hash_password(&form.password, state.bcrypt_cost)?;
    // A concurrent registration can still win the race; the unique index decides.
    let created = db::create_user(&state.pool, &form.username, &hash, state.starting_cash).await?;
    if created.is_none() {
        return Err(AppError::apology("username already taken"));
    }

    info!("Registered {}", form.username);
    Ok(append_cookie(
        redirect_home("Registered Successfully!"),
        auth::clear_session_cookie(),
    ))
}

fn logout_handler() -> Response {
    let reply = warp::redirect::see_other(Uri::from_static("/"));
    warp::reply::with_header(reply, "set-cookie", auth::clear_session_cookie())
        .into_response()
}

async fn account_handler(
    state: Arc<AppState>,
    user: User,
    form: AccountForm,
) -> Result<Response, Rejection> {
    account(&state, user, form).await.map_err(warp::reject::custom)
}

async fn account(state: &AppState, user: User, form: AccountForm) -> Result<Response, AppError> {
    if form.old_password.is_empty() {
        return Err(AppError::apology("must provide password"));
    }
    if form.new_password.is_empty() {
        return Err(AppError::apology("must provide new password"));
    }
    if form.new_confirmation.is_empty() {
        return Err(AppError::apology("must confirm new password"));
    }
    if form.new_password != form.new_confirmation {
        return Err(AppError::apology("new passwords must match"));
    }
    if !auth::verify_password(&form.old_password, &user.hash)? {
        return Err(AppError::apology("current password is invalid"));
    }

    let hash = auth::hash_password(&form.new_password, state.bcrypt_cost)?;
    db::update_password(&state.pool, user.id, &hash).await?;
    info!("{} changed password", user.username);
    Ok(redirect_home("Password Changed!"))
}
