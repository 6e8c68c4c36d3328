//! HTTP surface.
//!
//! Routes for signup, login, balance and transfer. Handlers are thin: every
//! credential check goes through the [`AuthGate`], every balance change
//! through the [`Engine`].

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use axum::routing::{get, post};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::Engine;
use crate::auth::{AuthError, AuthGate, SessionToken};
use crate::model::AccountNumber;

mod error;
mod handlers;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub gate: Arc<dyn AuthGate>,
}

/// The logged-in account behind an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct Caller {
    pub token: SessionToken,
    pub account_number: AccountNumber,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| SessionToken::from(token.trim()))
            .ok_or(ApiError::Auth(AuthError::Unauthenticated))?;

        let account_number = state.gate.session(&token).await?;
        Ok(Caller {
            token,
            account_number,
        })
    }
}

pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/signup", post(handlers::signup))
        .route("/login", post(handlers::login))
        .route("/transfer", post(handlers::transfer))
        .route("/transfer/{request_id}", get(handlers::transfer_status))
        .route("/api/balance", post(handlers::balance))
        .route("/api/verify-pin", post(handlers::balance));

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
