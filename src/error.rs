// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.
//!
//! Bodies never carry internal detail. When there is some, it rides along in
//! an [`ErrorDetail`] response extension, and the `expose_error_details`
//! middleware copies it into the body in development only.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;

use crate::db::StoreError;
use crate::models::{Feature, PlanTier};
use crate::response::{ApiResponse, ErrorBody};

/// Why an OAuth callback was rejected. Logged, never sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    StateNotFound,
    StateExpired,
    StateAlreadyUsed,
    PkceMismatch,
    ProviderDenied(String),
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::StateNotFound => "state_not_found",
            AuthFailure::StateExpired => "state_expired",
            AuthFailure::StateAlreadyUsed => "state_already_used",
            AuthFailure::PkceMismatch => "pkce_mismatch",
            AuthFailure::ProviderDenied(_) => "provider_denied",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::ProviderDenied(reason) => write!(f, "provider_denied: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Authentication failed ({0})")]
    AuthenticationFailed(AuthFailure),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Rate limit exceeded ({limit} requests per window)")]
    RateLimitExceeded { limit: u64, retry_after: Duration },

    #[error("Usage limit exceeded for {feature} ({limit} per period)")]
    UsageLimitExceeded {
        feature: Feature,
        limit: u64,
        retry_after: Duration,
    },

    #[error("Feature {feature} is not available on the {tier} plan")]
    FeatureNotAvailable { feature: Feature, tier: PlanTier },

    #[error("Plan {required} or higher required (current: {current})")]
    TierRequired { required: PlanTier, current: PlanTier },

    #[error("Identity provider error: {0}")]
    UpstreamProvider(String),

    #[error("Storage unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Internal detail for an error response; see the module docs.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

/// Whole seconds a client should wait, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::InvalidToken | AppError::AuthenticationFailed(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_)
            | AppError::FeatureNotAvailable { .. }
            | AppError::TierRequired { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded { .. } | AppError::UsageLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::UpstreamProvider(_) => StatusCode::BAD_GATEWAY,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidToken => "invalid_token",
            AppError::AuthenticationFailed(_) => "authentication_failed",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AppError::UsageLimitExceeded { .. } => "usage_limit_exceeded",
            AppError::FeatureNotAvailable { .. } => "feature_not_available",
            AppError::TierRequired { .. } => "tier_required",
            AppError::UpstreamProvider(_) => "upstream_provider_error",
            AppError::StoreUnavailable(_) => "service_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Seconds until retrying can succeed, for 429 responses.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimitExceeded { retry_after, .. }
            | AppError::UsageLimitExceeded { retry_after, .. } => {
                Some(retry_after_secs(*retry_after))
            }
            _ => None,
        }
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Unauthorized => "Authentication required".to_string(),
            AppError::InvalidToken => "Invalid or expired token".to_string(),
            AppError::AuthenticationFailed(_) => "Authentication failed".to_string(),
            AppError::Forbidden(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("Not found: {msg}"),
            AppError::Validation(msg) => msg.clone(),
            AppError::RateLimitExceeded { .. } => {
                "Rate limit exceeded, retry later".to_string()
            }
            AppError::UsageLimitExceeded { feature, .. } => {
                format!("Usage limit for {feature} reached for this period")
            }
            AppError::FeatureNotAvailable { feature, .. } => {
                format!("Feature {feature} is not available on your plan")
            }
            AppError::TierRequired { required, .. } => {
                format!("This requires the {required} plan or higher")
            }
            AppError::UpstreamProvider(_) => "Identity provider request failed".to_string(),
            AppError::StoreUnavailable(_) => "Service temporarily unavailable".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    fn meta(&self) -> Option<serde_json::Value> {
        match self {
            AppError::RateLimitExceeded { limit, .. } => Some(json!({
                "limit": limit,
                "retry_after": self.retry_after(),
            })),
            AppError::UsageLimitExceeded { feature, limit, .. } => Some(json!({
                "feature": feature,
                "limit": limit,
                "retry_after": self.retry_after(),
            })),
            AppError::FeatureNotAvailable { feature, tier } => Some(json!({
                "feature": feature,
                "current_tier": tier,
            })),
            AppError::TierRequired { required, current } => Some(json!({
                "required_tier": required,
                "current_tier": current,
            })),
            _ => None,
        }
    }

    fn internal_detail(&self) -> Option<String> {
        match self {
            AppError::AuthenticationFailed(cause) => Some(cause.to_string()),
            AppError::UpstreamProvider(msg) => Some(msg.clone()),
            AppError::StoreUnavailable(err) => Some(err.to_string()),
            AppError::Internal(err) => Some(format!("{err:#}")),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            AppError::AuthenticationFailed(cause) => {
                tracing::warn!(cause = %cause, "Authentication failed");
            }
            AppError::UpstreamProvider(msg) => {
                tracing::error!(error = %msg, "Identity provider error");
            }
            AppError::StoreUnavailable(err) => {
                tracing::error!(error = %err, "Storage unavailable");
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
            }
            _ => {}
        }

        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.client_message(),
            meta: self.meta(),
            details: None,
        };

        let mut response = (status, ApiResponse::failure(body.clone())).into_response();

        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }

        if let Some(detail) = self.internal_detail() {
            response.extensions_mut().insert(body);
            response.extensions_mut().insert(ErrorDetail(detail));
        }

        response
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_auth_failures_share_client_message() {
        let causes = [
            AuthFailure::StateNotFound,
            AuthFailure::StateExpired,
            AuthFailure::StateAlreadyUsed,
            AuthFailure::PkceMismatch,
        ];
        let messages: Vec<String> = causes
            .into_iter()
            .map(|c| AppError::AuthenticationFailed(c).client_message())
            .collect();
        assert!(messages.iter().all(|m| m == "Authentication failed"));
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let response = AppError::RateLimitExceeded {
            limit: 100,
            retry_after: Duration::from_secs(42),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_detail_only_in_extension() {
        let response = AppError::UpstreamProvider("token endpoint 500".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert_eq!(detail.0, "token endpoint 500");
    }
}
