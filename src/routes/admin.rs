// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Operator routes, behind `require_admin_token`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::PlanTier;
use crate::response::ApiResponse;
use crate::routes::api::UserView;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/users/{id}/tier", put(set_tier))
        .route("/admin/users/{id}/sessions/revoke", post(revoke_sessions))
}

fn parse_user_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| AppError::Validation("user id must be a UUID".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    pub tier: PlanTier,
}

/// Explicit plan change (upgrade or downgrade).
async fn set_tier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: std::result::Result<Json<SetTierRequest>, JsonRejection>,
) -> Result<ApiResponse<UserView>> {
    let id = parse_user_id(&id)?;
    let Json(request) = body.map_err(|e| AppError::Validation(e.body_text()))?;

    let user = state
        .stores
        .users
        .set_tier(id, request.tier)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;

    tracing::info!(user_id = %user.id, tier = %user.tier, "User tier changed");

    Ok(ApiResponse::ok(UserView::from(&user)))
}

#[derive(Debug, Serialize)]
pub struct RevokedSessions {
    pub revoked: usize,
}

/// Breach response: revoke every refresh token of a user. Access tokens
/// already issued stay valid until they expire.
async fn revoke_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<ApiResponse<RevokedSessions>> {
    let id = parse_user_id(&id)?;
    let revoked = state.sessions.invalidate_all_for_user(id).await?;
    Ok(ApiResponse::ok(RevokedSessions { revoked }))
}
