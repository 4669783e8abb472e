// src/auth.rs
use crate::api::AppState;
use crate::db;
use crate::error::AppError;
use crate::models::User;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection};

pub const SESSION_COOKIE: &str = "session";
const SESSION_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Signs a session token naming `user_id`.
pub fn create_token(user_id: i64, secret: &str) -> Result<String, AppError> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + Duration::hours(SESSION_HOURS)).timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Returns the user id carried by a valid, unexpired token.
pub fn verify_token(token: &str, secret: &str) -> Option<i64> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims.sub.parse().ok(),
        Err(e) => {
            warn!("Rejected session token: {}", e);
            None
        }
    }
}

pub fn hash_password(password: &str, cost: u32) -> Result<String, AppError> {
    Ok(bcrypt::hash(password, cost)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    Ok(bcrypt::verify(password, hash)?)
}

pub fn session_cookie(token: &str) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        SESSION_HOURS * 3600
    )
}

pub fn clear_session_cookie() -> String {
    format!("{}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Resolves the logged-in user from the session cookie, rejecting with
/// `AppError::Unauthorized` when there is none.
pub fn with_user(
    state: Arc<AppState>,
) -> impl Filter<Extract = (User,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE).and_then(move |token: Option<String>| {
        let state = state.clone();
        async move {
            let Some(user_id) = token
                .as_deref()
                .and_then(|token| verify_token(token, &state.session_secret))
            else {
                return Err(warp::reject::custom(AppError::Unauthorized));
            };

            match db::find_user_by_id(&state.pool, user_id).await {
                Ok(Some(user)) => Ok(user),
                Ok(None) => Err(warp::reject::custom(AppError::Unauthorized)),
                Err(e) => Err(warp::reject::custom(e)),
            }
        }
    })
}
