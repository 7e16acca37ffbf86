use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::responses::RequestMeta;

pub const E_INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
pub const E_INVALID_BUNDLE: &str = "INVALID_BUNDLE";
pub const E_INVALID_PRICE: &str = "INVALID_PRICE";
pub const E_INVALID_AMOUNT: &str = "INVALID_AMOUNT";
pub const E_PRICING_UNAVAILABLE: &str = "PRICING_UNAVAILABLE";
pub const E_USER_NOT_FOUND: &str = "USER_NOT_FOUND";
pub const E_USER_CONFLICT: &str = "USER_CONFLICT";
pub const E_ORDER_NOT_FOUND: &str = "ORDER_NOT_FOUND";
pub const E_ORDER_NOT_PAID: &str = "ORDER_NOT_PAID";
pub const E_VERIFICATION_FAILED: &str = "VERIFICATION_FAILED";
pub const E_CONTENTION: &str = "CONTENTION";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_GATEWAY_FAILURE: &str = "GATEWAY_FAILURE";
pub const E_UNAUTHORIZED: &str = "UNAUTHORIZED";

/// Failures of the settlement and ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient wallet balance: need {required}, have {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },
    #[error("unsupported bundle size: {0} GB")]
    InvalidBundle(u32),
    #[error("price per GB must be positive, in whole pesewas and within range, got {0}")]
    InvalidPrice(Decimal),
    #[error("amount must be positive, in whole pesewas and within range, got {0}")]
    InvalidAmount(Decimal),
    #[error("pricing unavailable: {0:#}")]
    PricingUnavailable(anyhow::Error),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("{0} is already registered")]
    UserConflict(String),
    #[error("order {0} not found")]
    OrderNotFound(String),
    #[error("order {0} has not been paid")]
    OrderNotPaid(Uuid),
    #[error("payment verification failed for {reference}: {reason}")]
    VerificationFailed { reference: String, reason: String },
    /// Raised only once the bounded compare-and-swap retries are exhausted.
    #[error("gave up after {attempts} conflicting updates")]
    ConcurrencyConflict { attempts: usize },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        LedgerError::Storage(e)
    }
}

impl LedgerError {
    /// The machine-readable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => E_INSUFFICIENT_FUNDS,
            LedgerError::InvalidBundle(_) => E_INVALID_BUNDLE,
            LedgerError::InvalidPrice(_) => E_INVALID_PRICE,
            LedgerError::InvalidAmount(_) => E_INVALID_AMOUNT,
            LedgerError::PricingUnavailable(_) => E_PRICING_UNAVAILABLE,
            LedgerError::UserNotFound(_) => E_USER_NOT_FOUND,
            LedgerError::UserConflict(_) => E_USER_CONFLICT,
            LedgerError::OrderNotFound(_) => E_ORDER_NOT_FOUND,
            LedgerError::OrderNotPaid(_) => E_ORDER_NOT_PAID,
            LedgerError::VerificationFailed { .. } => E_VERIFICATION_FAILED,
            LedgerError::ConcurrencyConflict { .. } => E_CONTENTION,
            LedgerError::Gateway(_) => E_GATEWAY_FAILURE,
            LedgerError::Storage(_) => E_DB_FAILURE,
        }
    }

    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let code = self.code();
        ApiError::from(self).with_meta(meta).with_code(code)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds { .. }
            | LedgerError::InvalidBundle(_)
            | LedgerError::InvalidPrice(_)
            | LedgerError::InvalidAmount(_)
            | LedgerError::VerificationFailed { .. } => ApiError::BadRequest(e.to_string()),
            LedgerError::UserNotFound(_) | LedgerError::OrderNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            LedgerError::UserConflict(_) | LedgerError::OrderNotPaid(_) => {
                ApiError::Conflict(e.to_string())
            }
            LedgerError::ConcurrencyConflict { .. } | LedgerError::PricingUnavailable(_) => {
                error!("transient failure: {}", e);
                ApiError::Unavailable("service busy, retry shortly".to_string())
            }
            LedgerError::Gateway(_) | LedgerError::Storage(_) => ApiError::Internal(e.into()),
        }
    }
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
