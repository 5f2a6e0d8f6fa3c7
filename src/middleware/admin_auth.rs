// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Static bearer token check for `/admin/*` routes.

use crate::crypto_utils::constant_time_eq;
use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Require `Authorization: Bearer <ADMIN_API_TOKEN>`. Without a configured
/// token the admin routes do not exist.
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        return Err(AppError::NotFound("admin API is disabled".to_string()));
    };

    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .ok_or(AppError::Unauthorized)?;

    if !constant_time_eq(supplied, expected) {
        tracing::warn!(path = %request.uri().path(), "Blocked admin request with invalid token");
        return Err(AppError::Forbidden("Invalid admin token".to_string()));
    }

    Ok(next.run(request).await)
}
