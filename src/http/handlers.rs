use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::error::ApiError;
use super::{AppState, Caller};
use crate::Amount;
use crate::auth::{Credentials, Signup};
use crate::engine::TransferError;
use crate::model::{AccountNumber, FailureReason, LedgerStatus, RequestId, TransferRequest};

// Signup / login

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub message: &'static str,
    pub account_number: AccountNumber,
}

pub async fn signup(
    State(state): State<AppState>,
    form: Result<Json<Signup>, JsonRejection>,
) -> Result<Json<SignupResponse>, ApiError> {
    let Json(form) = form?;
    let account = state.gate.signup(form).await?;
    Ok(Json(SignupResponse {
        message: "User signed up successfully.",
        account_number: account.account_number,
    }))
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    pub token: String,
}

pub async fn login(
    State(state): State<AppState>,
    credentials: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(credentials) = credentials?;
    let token = state.gate.authenticate(&credentials).await?;
    Ok(Json(LoginResponse {
        message: "Login successful!",
        token: token.as_str().to_string(),
    }))
}

// Transfer

/// Amount as sent by the form: a JSON number or a numeric string. Anything
/// else (fractions, out of range numbers, null) is kept so it can be
/// rejected as an invalid amount rather than a malformed body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(i64),
    Text(String),
    Other(serde_json::Value),
}

impl RawAmount {
    fn minor_units(&self) -> Result<i64, ApiError> {
        match self {
            RawAmount::Number(n) => Ok(*n),
            RawAmount::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ApiError::InvalidAmount(s.clone())),
            RawAmount::Other(value) => Err(ApiError::InvalidAmount(value.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub receiver_account_number: AccountNumber,
    pub mobile_number: String,
    pub transfer_pin: String,
    pub amount: RawAmount,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub message: &'static str,
    pub request_id: RequestId,
    pub balance: Amount,
    pub replayed: bool,
}

pub async fn transfer(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<TransferBody>, JsonRejection>,
) -> Result<Json<TransferResponse>, ApiError> {
    let Json(body) = body?;
    state
        .gate
        .authorize(&caller.token, &caller.account_number, &body.transfer_pin)
        .await?;

    let request = TransferRequest {
        receiver_account_number: body.receiver_account_number.trim().to_string(),
        receiver_mobile_number: body.mobile_number.trim().to_string(),
        amount: body.amount.minor_units()?,
        request_id: body
            .request_id
            .filter(|id| !id.trim().is_empty())
            .map_or_else(RequestId::generate, RequestId::from),
    };

    // run on its own task so a dropped connection cannot stop the transfer
    // between debit and commit
    let engine = state.engine.clone();
    let sender = caller.account_number.clone();
    let receipt = tokio::spawn(async move { engine.transfer(&sender, request).await })
        .await
        .map_err(|e| {
            error!(reason = %e, "transfer task failed");
            ApiError::Transfer(TransferError::StorageUnavailable(e.to_string()))
        })??;
    Ok(Json(TransferResponse {
        message: "Amount transferred successfully.",
        request_id: receipt.request_id,
        balance: receipt.sender_balance,
        replayed: receipt.replayed,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatusResponse {
    pub request_id: RequestId,
    pub status: LedgerStatus,
    pub receiver: AccountNumber,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Status of one of the caller's own transfers.
pub async fn transfer_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(request_id): Path<String>,
) -> Result<Json<TransferStatusResponse>, ApiError> {
    let entry = state
        .engine
        .entry(&RequestId::from(request_id))
        .await?
        .filter(|entry| entry.sender == caller.account_number)
        .ok_or(ApiError::TransferNotFound)?;

    Ok(Json(TransferStatusResponse {
        request_id: entry.request_id,
        status: entry.status,
        receiver: entry.receiver,
        amount: entry.amount,
        reason: entry.reason,
    }))
}

// Balance

#[derive(Debug, Deserialize)]
pub struct PinBody {
    pub pin: String,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: Amount,
}

/// Serves both `/api/balance` and `/api/verify-pin`.
pub async fn balance(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<PinBody>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let Json(body) = body?;
    let account = state
        .gate
        .verify_pin(&caller.token, &body.pin)
        .await
        .map_err(ApiError::Pin)?;
    Ok(Json(BalanceResponse {
        balance: account.balance,
    }))
}
