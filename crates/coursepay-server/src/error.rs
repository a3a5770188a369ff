use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use coursepay_store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate purchase, reused approval hash, or a terminal escrow.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Registry/token verification failure.  Clients get a generic
    /// message; the full reason is logged server-side before this is
    /// constructed.
    #[error("Payment verification failed")]
    VerificationFailed,

    /// Payment system misconfiguration (missing escrow contract,
    /// missing operator role).  Surfaced at calculate-time so buyers
    /// never sign an approval that cannot settle.
    #[error("Payment system unavailable, please contact support")]
    Misconfigured,

    /// The escrow creation failed after the ledger row was written.  The
    /// purchase id and approval hash are returned so the buyer's
    /// on-chain approval is never silently lost.
    #[error("Escrow creation failed: {detail}")]
    ChainFailure {
        purchase_id: Uuid,
        approval_tx_hash: String,
        detail: String,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::Conflict(_) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::VerificationFailed => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": "Payment verification failed" }),
            ),
            ApiError::Misconfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::ChainFailure {
                purchase_id,
                approval_tx_hash,
                ..
            } => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "error": "Escrow creation failed; the purchase is recorded for remediation",
                    "purchase_id": purchase_id,
                    "approval_tx_hash": approval_tx_hash,
                }),
            ),
            ApiError::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Internal server error" }),
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("record not found".into()),
            StoreError::DuplicatePurchase => {
                ApiError::Conflict("already purchased this course".into())
            }
            StoreError::TxHashConflict => {
                ApiError::Conflict("transaction hash already used".into())
            }
            StoreError::IllegalTransition { from, to } => {
                ApiError::Conflict(format!("escrow state does not allow {from} -> {to}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
