// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Tier-aware admission for authenticated routes.
//!
//! Runs after `require_auth`: resolves the caller's current tier, runs the
//! API pipeline, and decorates the response with quota headers.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::services::{AdmissionContext, QuotaSnapshot};
use crate::{AppState, API_ENDPOINT_CLASS};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

fn set_quota_headers(headers: &mut HeaderMap, quota: &QuotaSnapshot) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(quota.reset_secs()));
}

/// Take a request back off the count when its outcome is configured not to
/// count. Only the window the request was counted in is touched.
async fn settle(state: &AppState, quota: &QuotaSnapshot, status: StatusCode) {
    if !quota.should_uncount(status) {
        return;
    }
    let uncounted = state
        .stores
        .rate_limits
        .decrement(&quota.key, quota.resets_in)
        .await;
    if let Err(e) = uncounted {
        tracing::warn!(error = %e, key = %quota.key, "Failed to uncount skipped request");
    }
}

pub async fn admit(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_user = request
        .extensions()
        .get::<AuthUser>()
        .copied()
        .ok_or(AppError::Unauthorized)?;

    // The token's tier claim may be stale; the repository is authoritative.
    let user = state
        .stores
        .users
        .find_by_id(auth_user.user_id)
        .await?
        .ok_or(AppError::InvalidToken)?;

    let ctx = AdmissionContext::for_user(user.id, user.tier, API_ENDPOINT_CLASS);
    let decision = state.api_pipeline.run(&ctx).await;

    if let Some(denial) = decision.denial {
        let response = denial.into_response();
        if let Some(quota) = &decision.quota {
            settle(&state, quota, response.status()).await;
        }
        return Ok(response);
    }

    request.extensions_mut().insert(ctx);
    request.extensions_mut().insert(user);

    let mut response = next.run(request).await;

    if let Some(quota) = &decision.quota {
        set_quota_headers(response.headers_mut(), quota);
        settle(&state, quota, response.status()).await;
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::GoogleProvider;
    use crate::Stores;
    use std::time::Duration;

    fn assert_send<T: Send>(_: &T) {}

    fn test_state() -> AppState {
        let config = Config::test_default();
        let stores = Stores::memory(&config);
        let provider = Arc::new(GoogleProvider::new(&config).unwrap());
        AppState::new(config, stores, provider).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_uncounts_failed_response() {
        let state = test_state();
        let key = "ratelimit:user:1:api";
        let window = Duration::from_secs(3600);
        state.stores.rate_limits.increment(key, window).await.unwrap();
        let counted = state.stores.rate_limits.increment(key, window).await.unwrap();

        let quota = QuotaSnapshot {
            key: key.to_string(),
            limit: 100,
            remaining: 98,
            resets_in: counted.resets_in,
            skip_failed_requests: true,
            skip_successful_requests: false,
        };

        settle(&state, &quota, StatusCode::OK).await;
        assert_eq!(state.stores.rate_limits.get(key).await.unwrap(), Some(2));

        // Middleware futures must stay Send to be used as a layer.
        let pending = settle(&state, &quota, StatusCode::INTERNAL_SERVER_ERROR);
        assert_send(&pending);
        pending.await;
        assert_eq!(state.stores.rate_limits.get(key).await.unwrap(), Some(1));
    }

    #[test]
    fn test_quota_headers() {
        let mut headers = HeaderMap::new();
        set_quota_headers(
            &mut headers,
            &QuotaSnapshot {
                key: "ratelimit:user:1:api".to_string(),
                limit: 100,
                remaining: 42,
                resets_in: Duration::from_millis(59_001),
                skip_failed_requests: false,
                skip_successful_requests: false,
            },
        );
        assert_eq!(headers[RATE_LIMIT_LIMIT], "100");
        assert_eq!(headers[RATE_LIMIT_REMAINING], "42");
        assert_eq!(headers[RATE_LIMIT_RESET], "60");
    }
}
