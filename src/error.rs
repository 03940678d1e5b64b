use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Shared user-facing messages.
pub mod msg {
    pub const ORDER_NOT_FOUND: &str = "Order not found";
    pub const EVENT_NOT_FOUND: &str = "Payment event not found";
    pub const GRANT_NOT_FOUND: &str = "Benefit grant not found";
    pub const SKU_NOT_FOUND: &str = "SKU not found or inactive";
    pub const UNKNOWN_PROVIDER: &str = "Unknown or disabled payment provider";
    pub const PAYLOAD_TOO_LARGE: &str = "Webhook payload exceeds size limit";
    pub const INVALID_JSON_PAYLOAD: &str = "Webhook payload is not valid JSON";
    pub const MISSING_EVENT_ID: &str = "Webhook payload has no provider event id";
    pub const INVALID_SIGNATURE_FORMAT: &str = "Invalid signature format";
    pub const INVALID_WEBHOOK_SECRET: &str = "Invalid webhook secret";
    pub const INSUFFICIENT_CREDITS: &str = "Insufficient wallet balance";
    pub const BENEFIT_CODE_REQUIRED: &str = "benefit_code is required";
    pub const IDEMPOTENCY_KEY_REQUIRED: &str = "idempotency_key is required";
    pub const BUYER_REQUIRED: &str = "user_id or anon_id is required";
    pub const INVALID_QUANTITY: &str = "quantity must be between 1 and 1000";
    pub const AMOUNT_OVERFLOW: &str = "Order amount overflows";
    pub const IDEMPOTENCY_KEY_REUSED: &str =
        "Idempotency key was already used for a different ledger entry";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unprocessable: {code}: {message}")]
    Unprocessable { code: ErrorCode, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<ProcessingFailure> for AppError {
    fn from(failure: ProcessingFailure) -> Self {
        match failure.code {
            ErrorCode::OrderNotFound => AppError::NotFound(failure.message),
            ErrorCode::Internal => AppError::Internal(failure.message),
            code => AppError::Unprocessable {
                code,
                message: failure.message,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, code, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", None, Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "Bad request", None, Some(msg.clone()))
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "Forbidden", None, Some(msg.clone())),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict", None, Some(msg.clone())),
            AppError::PaymentRequired(msg) => (
                StatusCode::PAYMENT_REQUIRED,
                "Payment required",
                Some(ErrorCode::InsufficientCredits.to_string()),
                Some(msg.clone()),
            ),
            AppError::PayloadTooLarge(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload too large",
                None,
                Some(msg.clone()),
            ),
            AppError::Unprocessable { code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Unprocessable",
                Some(code.to_string()),
                Some(message.clone()),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None, None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None, None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", None, Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None, None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            code,
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Converts `Option<T>` lookups into `NotFound` errors.
pub trait OptionExt<T> {
    fn or_not_found(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_not_found(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| AppError::NotFound(msg.to_string()))
    }
}

/// Failure codes persisted on payment events (`last_error_code`) and
/// returned by the operator API.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSignature,
    PayloadInvalid,
    OrderNotFound,
    ProviderMismatch,
    AmountMismatch,
    CurrencyMismatch,
    SkuNotFound,
    AttemptRequired,
    InvalidStateTransition,
    RefundExceedsPaid,
    InsufficientCredits,
    GrantFailed,
    LedgerFailed,
    MaxRetriesExceeded,
    Internal,
}

impl ErrorCode {
    /// Whether a later attempt can succeed without operator action.
    ///
    /// `InvalidStateTransition` is retryable because a refund can arrive
    /// before the paid event that it depends on.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::OrderNotFound
                | ErrorCode::InvalidStateTransition
                | ErrorCode::GrantFailed
                | ErrorCode::LedgerFailed
                | ErrorCode::Internal
        )
    }
}

/// A genuine processing failure: recorded on the payment event, never
/// surfaced to the provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProcessingFailure {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ProcessingFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    /// A failure that no retry can fix, whatever its code.
    pub fn permanent(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(code, message)
        }
    }
}

impl From<AppError> for ProcessingFailure {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Unprocessable { code, message } => ProcessingFailure::new(code, message),
            AppError::NotFound(msg) => ProcessingFailure::new(ErrorCode::OrderNotFound, msg),
            AppError::PaymentRequired(msg) => {
                ProcessingFailure::new(ErrorCode::InsufficientCredits, msg)
            }
            other => ProcessingFailure::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ProcessingFailure {
    fn from(err: rusqlite::Error) -> Self {
        ProcessingFailure::new(ErrorCode::Internal, err.to_string())
    }
}
