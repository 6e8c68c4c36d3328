use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::auth::AuthError;
use crate::engine::TransferError;

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    /// PIN re-check on the balance endpoints, answered as `{message}`.
    Pin(AuthError),
    Transfer(TransferError),
    InvalidAmount(String),
    /// Body missing, not JSON, or not the expected shape.
    BadRequest(String),
    TransferNotFound,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

#[derive(Serialize)]
struct MessageBody {
    message: String,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Auth(e) | ApiError::Pin(e) => auth_code(e),
            ApiError::Transfer(e) => transfer_code(e),
            ApiError::InvalidAmount(_) => "INVALID_AMOUNT",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::TransferNotFound => "TRANSFER_NOT_FOUND",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(e) | ApiError::Pin(e) => auth_status(e),
            ApiError::Transfer(e) => transfer_status(e),
            ApiError::InvalidAmount(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TransferNotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Text shown to the customer.
    pub fn message(&self) -> String {
        match self {
            ApiError::Auth(e) => auth_message(e).to_string(),
            ApiError::Pin(AuthError::InvalidPin) => "Invalid PIN".to_string(),
            ApiError::Pin(e) => auth_message(e).to_string(),
            ApiError::Transfer(e) => transfer_message(e),
            ApiError::InvalidAmount(raw) => format!("Invalid amount {raw:?}. Transfer failed."),
            ApiError::BadRequest(reason) => format!("Invalid request: {reason}"),
            ApiError::TransferNotFound => "Transfer not found.".to_string(),
        }
    }
}

fn auth_code(e: &AuthError) -> &'static str {
    match e {
        AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
        AuthError::Unauthenticated => "NOT_LOGGED_IN",
        AuthError::SessionExpired => "SESSION_EXPIRED",
        AuthError::Forbidden(_) => "FORBIDDEN",
        AuthError::InvalidPin => "INVALID_PIN",
        AuthError::DuplicateAccount(_) => "DUPLICATE_ACCOUNT",
        AuthError::InvalidSignup(_) => "INVALID_SIGNUP",
        AuthError::Hashing(_) | AuthError::Storage(_) => "INTERNAL_ERROR",
    }
}

fn auth_status(e: &AuthError) -> StatusCode {
    match e {
        AuthError::InvalidCredentials | AuthError::Unauthenticated | AuthError::SessionExpired => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
        AuthError::InvalidPin | AuthError::InvalidSignup(_) => StatusCode::BAD_REQUEST,
        AuthError::DuplicateAccount(_) => StatusCode::CONFLICT,
        AuthError::Hashing(_) | AuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn auth_message(e: &AuthError) -> &str {
    match e {
        AuthError::InvalidCredentials => "Invalid username or PIN.",
        AuthError::Unauthenticated => "User not logged in.",
        AuthError::SessionExpired => "Session expired. Please log in again.",
        AuthError::Forbidden(_) => "Not allowed.",
        AuthError::InvalidPin => "Invalid PIN. Transfer failed.",
        AuthError::DuplicateAccount(_) => "Account number or mobile number already registered.",
        AuthError::InvalidSignup(reason) => *reason,
        AuthError::Hashing(_) | AuthError::Storage(_) => "Internal error. Please try again.",
    }
}

fn transfer_code(e: &TransferError) -> &'static str {
    match e {
        TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
        TransferError::SelfTransfer(_) => "SELF_TRANSFER",
        TransferError::SenderNotFound(_) => "SENDER_NOT_FOUND",
        TransferError::ReceiverNotFound(_) => "RECEIVER_NOT_FOUND",
        TransferError::ReceiverMismatch(_) => "RECEIVER_MISMATCH",
        TransferError::RequestIdReused(_) => "REQUEST_ID_REUSED",
        TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
        TransferError::Contention(..) => "CONTENTION",
        TransferError::InProgress(_) => "IN_PROGRESS",
        TransferError::Abandoned(_) => "ABANDONED",
        TransferError::BalanceOverflow(_) | TransferError::CreditFailed(_) => "CREDIT_FAILED",
        TransferError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
    }
}

fn transfer_status(e: &TransferError) -> StatusCode {
    match e {
        TransferError::InvalidAmount(_)
        | TransferError::SelfTransfer(_)
        | TransferError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
        TransferError::SenderNotFound(_)
        | TransferError::ReceiverNotFound(_)
        | TransferError::ReceiverMismatch(_) => StatusCode::NOT_FOUND,
        TransferError::RequestIdReused(_)
        | TransferError::Contention(..)
        | TransferError::InProgress(_)
        | TransferError::Abandoned(_) => StatusCode::CONFLICT,
        TransferError::BalanceOverflow(_)
        | TransferError::CreditFailed(_)
        | TransferError::StorageUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn transfer_message(e: &TransferError) -> String {
    match e {
        TransferError::InvalidAmount(amount) => {
            format!("Invalid amount {amount}. Transfer failed.")
        }
        TransferError::SelfTransfer(_) => {
            "Cannot transfer to your own account. Transfer failed.".to_string()
        }
        TransferError::SenderNotFound(_) => "Sender account not found. Transfer failed.".to_string(),
        TransferError::ReceiverNotFound(_) => {
            "Receiver account number not found. Transfer failed.".to_string()
        }
        TransferError::ReceiverMismatch(_) => {
            "Receiver mobile number does not match. Transfer failed.".to_string()
        }
        TransferError::RequestIdReused(id) => {
            format!("Request id {id} was already used for a different transfer.")
        }
        TransferError::InsufficientFunds { .. } => {
            "Insufficient balance. Transfer failed.".to_string()
        }
        TransferError::Contention(..) => {
            "Account busy. Please retry with a new request id.".to_string()
        }
        TransferError::InProgress(_) => "Transfer is still being processed.".to_string(),
        TransferError::Abandoned(_) => {
            "Transfer was cancelled and any debit refunded. Please retry.".to_string()
        }
        TransferError::BalanceOverflow(_) | TransferError::CreditFailed(_) => {
            "Transfer failed. Your account was not charged.".to_string()
        }
        TransferError::StorageUnavailable(_) => "Error: Failed to transfer money.".to_string(),
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        ApiError::Transfer(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = ?self, "request failed");
        }

        match self {
            ApiError::Pin(AuthError::InvalidPin) => {
                (status, Json(MessageBody { message: self.message() })).into_response()
            }
            _ => {
                let body = ErrorBody {
                    error: self.message(),
                    code: self.code(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
