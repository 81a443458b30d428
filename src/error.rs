//! The proxy's error surface and its HTTP mapping.
//!
//! Every failure a priced call can hit collapses into [`ProxyError`], whose
//! `IntoResponse` impl produces the stable status/body contract: 402 for
//! payment (required or failed), 403 for inactive offers and challenge
//! rejections, 404 for unknown slugs, 409 for mutex contention, 429 with
//! rate-limit headers, 500 with a refund block, 504 for upstream timeouts.
//! Internal details are logged, never echoed.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::challenge::ChallengeError;
use crate::kv::RateDecision;
use crate::payment::PaymentRequirements;
use crate::refund::RefundOutcome;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Blink not found")]
    NotFound,
    #[error("Offer is not active")]
    OfferNotActive,
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error("Payment required")]
    PaymentRequired {
        requirements: Box<PaymentRequirements>,
        description: String,
    },
    #[error("Payment verification failed: {details}")]
    PaymentVerificationFailed { details: String },
    #[error("Payment processing in progress")]
    Contention,
    #[error("Maximum claims reached for this offer")]
    ClaimLimitReached,
    #[error("Rate limit exceeded")]
    RateLimited {
        wallet: String,
        decision: RateDecision,
    },
    #[error("Upstream execution failed: {details}")]
    UpstreamFailed {
        details: String,
        refund: RefundOutcome,
        retry_allowed: bool,
    },
    #[error("Upstream timed out")]
    UpstreamTimeout,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ProxyError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateReference => {
                ProxyError::Validation("Reference already exists".to_string())
            }
            StoreError::SignatureInUse => ProxyError::PaymentVerificationFailed {
                details: "Payment signature already used by another run".to_string(),
            },
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "Blink not found" }))).into_response()
            }
            ProxyError::OfferNotActive => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "offer_not_active",
                    "message": "This offer is not accepting calls",
                })),
            )
                .into_response(),
            ProxyError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation_failed", "message": message })),
            )
                .into_response(),
            ProxyError::Challenge(error) => challenge_response(error),
            ProxyError::PaymentRequired {
                requirements,
                description,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "status": 402,
                    "message": "Payment Required",
                    "payment": *requirements,
                    "description": description,
                })),
            )
                .into_response(),
            ProxyError::PaymentVerificationFailed { details } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": "Payment verification failed",
                    "details": details,
                })),
            )
                .into_response(),
            ProxyError::ClaimLimitReached => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "claim_limit_reached",
                    "message": "Maximum claims reached for this offer",
                })),
            )
                .into_response(),
            ProxyError::Contention => {
                let mut response = (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": "Payment processing in progress",
                        "retryAfter": 5,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
                response
            }
            ProxyError::RateLimited { wallet, decision } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "retry_after": decision.retry_after_secs,
                        "wallet": wallet,
                    })),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(
                    "X-Ratelimit-Limit",
                    HeaderValue::from_str(&decision.limit.to_string())
                        .unwrap_or(HeaderValue::from_static("0")),
                );
                headers.insert(
                    "X-Ratelimit-Remaining",
                    HeaderValue::from_str(&decision.remaining.to_string())
                        .unwrap_or(HeaderValue::from_static("0")),
                );
                headers.insert(
                    "X-Ratelimit-Reset",
                    HeaderValue::from_str(&decision.retry_after_secs.to_string())
                        .unwrap_or(HeaderValue::from_static("0")),
                );
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_str(&decision.retry_after_secs.to_string())
                        .unwrap_or(HeaderValue::from_static("3600")),
                );
                response
            }
            ProxyError::UpstreamFailed {
                details,
                refund,
                retry_allowed,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Upstream execution failed",
                    "details": details,
                    "refund": refund.to_body(),
                    "retryAllowed": retry_allowed,
                })),
            )
                .into_response(),
            ProxyError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "error": "Upstream timed out",
                    "retryAllowed": true,
                })),
            )
                .into_response(),
            ProxyError::Internal(detail) => {
                tracing::error!(detail, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "internal_error",
                        "message": "Internal server error",
                    })),
                )
                    .into_response()
            }
        }
    }
}

fn challenge_response(error: ChallengeError) -> Response {
    match &error {
        ChallengeError::Store(detail) => {
            tracing::error!(%detail, "Challenge store unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "Internal server error",
                })),
            )
                .into_response()
        }
        ChallengeError::Replayed => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "challenge already used",
                "message": error.to_string(),
            })),
        )
            .into_response(),
        _ => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "invalid_challenge",
                "message": error.to_string(),
            })),
        )
            .into_response(),
    }
}
