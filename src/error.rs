// src/error.rs
use crate::lookup::QuoteError;
use log::error;
use serde::Serialize;
use std::convert::Infallible;
use warp::http::{StatusCode, Uri};
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Apology { message: String, status: StatusCode },
    #[error("login required")]
    Unauthorized,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("password hashing error: {0}")]
    Password(#[from] bcrypt::BcryptError),
    #[error("session token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("quote lookup failed: {0}")]
    Quote(#[from] QuoteError),
}

impl AppError {
    /// A user-facing validation failure answered with 403.
    pub fn apology(message: impl Into<String>) -> Self {
        Self::with_status(message, StatusCode::FORBIDDEN)
    }

    pub fn with_status(message: impl Into<String>, status: StatusCode) -> Self {
        AppError::Apology {
            message: message.into(),
            status,
        }
    }
}

impl Reject for AppError {}

#[derive(Serialize)]
struct ApologyBody<'a> {
    code: u16,
    message: &'a str,
}

pub fn apology(message: &str, status: StatusCode) -> warp::reply::Response {
    let body = ApologyBody {
        code: status.as_u16(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

/// Turns every rejection into an apology reply, or a redirect to the login
/// page when the session is missing.
pub async fn recover(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if let Some(app_err) = err.find::<AppError>() {
        return Ok(match app_err {
            AppError::Apology { message, status } => apology(message, *status),
            AppError::Unauthorized => {
                warp::redirect::see_other(Uri::from_static("/login")).into_response()
            }
            other => {
                error!("Request failed: {}", other);
                internal_error()
            }
        });
    }

    if err.is_not_found() {
        return Ok(apology("Not Found", StatusCode::NOT_FOUND));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(apology("Method Not Allowed", StatusCode::METHOD_NOT_ALLOWED));
    }
    if err.find::<warp::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
    {
        return Ok(apology("Bad Request", StatusCode::BAD_REQUEST));
    }
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(apology("Payload Too Large", StatusCode::PAYLOAD_TOO_LARGE));
    }

    error!("Unhandled rejection: {:?}", err);
    Ok(internal_error())
}

fn internal_error() -> warp::reply::Response {
    apology("Internal Server Error", StatusCode::INTERNAL_SERVER_ERROR)
}
