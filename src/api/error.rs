//! HTTP error taxonomy
//!
//! Every failure leaving the gateway is one of these kinds, rendered as
//! `{"error": <kind>, "message": <string>, ...}`. Component errors are
//! converted at the pipeline boundary; nothing upstream-shaped leaks
//! through unmapped.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::auth::KeyStoreError;
use crate::db::DbError;
use crate::providers::ProviderError;
use crate::quota::AdmitError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("quota exceeded on {dimension}")]
    QuotaExceeded {
        dimension: &'static str,
        detail: serde_json::Value,
        resets_at: String,
    },
    #[error("too many concurrent requests")]
    TooManyConcurrent { limit: i64 },
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("no provider available")]
    NoProviderAvailable,
    #[error("model not allowed: {model}")]
    ModelNotAllowed { model: String },
    #[error("upstream failure: {message}")]
    Llm {
        status: u16,
        message: String,
        request_id: String,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Validation(_) => "validation_error",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::TooManyConcurrent { .. } => "too_many_concurrent",
            ApiError::RateLimited => "rate_limit_exceeded",
            ApiError::NoProviderAvailable => "no_provider_available",
            ApiError::ModelNotAllowed { .. } => "model_not_allowed",
            ApiError::Llm { .. } => "llm_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Map a terminal provider failure, tagging it with the request id.
    /// Validation-like upstream responses keep a 4xx class; everything else
    /// is a 502.
    pub fn from_provider(error: ProviderError, request_id: &str) -> Self {
        match error {
            ProviderError::NoProviderAvailable => ApiError::NoProviderAvailable,
            ProviderError::ModelNotAllowed { model } => ApiError::ModelNotAllowed { model },
            ProviderError::InvalidRequest(message) => ApiError::Validation(message),
            ProviderError::Api { status, message } if (400..500).contains(&status) => {
                ApiError::Llm {
                    status: 400,
                    message,
                    request_id: request_id.to_string(),
                }
            }
            other => ApiError::Llm {
                status: 502,
                message: other.to_string(),
                request_id: request_id.to_string(),
            },
        }
    }

    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        match self {
            ApiError::QuotaExceeded {
                dimension,
                detail,
                resets_at,
            } => {
                body["dimension"] = serde_json::json!(dimension);
                body["resets_at"] = serde_json::json!(resets_at);
                if let (Some(obj), Some(extra)) = (body.as_object_mut(), detail.as_object()) {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            ApiError::TooManyConcurrent { limit } => {
                body["limit"] = serde_json::json!(limit);
            }
            ApiError::Llm { request_id, .. } => {
                body["request_id"] = serde_json::json!(request_id);
            }
            _ => {}
        }
        body
    }

    /// What the client sees. Internal faults get a generic message; the
    /// detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal error".to_string(),
            ApiError::QuotaExceeded { dimension, .. } => {
                format!("quota exceeded on {}", dimension)
            }
            ApiError::TooManyConcurrent { limit } => {
                format!("too many concurrent requests (limit {})", limit)
            }
            ApiError::RateLimited => "rate limit exceeded, slow down".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Validation(_) | ApiError::ModelNotAllowed { .. } => StatusCode::BAD_REQUEST,
            ApiError::QuotaExceeded { .. }
            | ApiError::TooManyConcurrent { .. }
            | ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NoProviderAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Llm { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.body())
    }
}

impl From<DbError> for ApiError {
    fn from(error: DbError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<KeyStoreError> for ApiError {
    fn from(error: KeyStoreError) -> Self {
        match error {
            KeyStoreError::InvalidKey => ApiError::Unauthorized("invalid API key".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AdmitError> for ApiError {
    fn from(error: AdmitError) -> Self {
        match error {
            AdmitError::DailyRequests {
                limit,
                used,
                resets_at,
            } => ApiError::QuotaExceeded {
                dimension: "daily_requests",
                detail: serde_json::json!({"limit": limit, "used": used}),
                resets_at: resets_at.to_rfc3339(),
            },
            AdmitError::DailyTokens {
                limit,
                used,
                resets_at,
            } => ApiError::QuotaExceeded {
                dimension: "daily_tokens",
                detail: serde_json::json!({"limit": limit, "used": used}),
                resets_at: resets_at.to_rfc3339(),
            },
            AdmitError::MonthlySpend {
                cap_usd,
                used_usd,
                resets_at,
            } => ApiError::QuotaExceeded {
                dimension: "monthly_spend",
                detail: serde_json::json!({"cap_usd": cap_usd, "used_usd": used_usd}),
                resets_at: resets_at.to_rfc3339(),
            },
            AdmitError::TooManyConcurrent { limit } => ApiError::TooManyConcurrent { limit },
            AdmitError::MissingQuota(user_id) => {
                ApiError::Internal(format!("quota row missing for user {}", user_id))
            }
            AdmitError::Db(e) => ApiError::Internal(e.to_string()),
        }
    }
}
