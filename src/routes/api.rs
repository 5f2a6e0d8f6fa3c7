// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Authenticated API routes. Every handler here runs behind `require_auth`
//! and `admit`, so the resolved user and admission context are available as
//! request extensions.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Extension, Router,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

use crate::db::keys;
use crate::error::{AppError, Result};
use crate::models::{tier_features, Feature, PlanTier, User};
use crate::response::ApiResponse;
use crate::services::admission::{metered_usage, FeatureUsage};
use crate::services::{AdmissionContext, AdmissionPipeline, FeatureGuard, Guard, UsageGuard};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/usage", get(get_usage))
        .route("/api/features/{feature}", get(check_feature))
        .route("/api/features/{feature}/use", post(use_feature))
}

/// User as returned to clients.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct UserView {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub tier: PlanTier,
    pub features: Vec<Feature>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            picture: user.picture.clone(),
            tier: user.tier,
            features: tier_features(user.tier).to_vec(),
        }
    }
}

async fn get_me(Extension(user): Extension<User>) -> ApiResponse<UserView> {
    ApiResponse::ok(UserView::from(&user))
}

#[derive(Debug, Serialize)]
pub struct QuotaView {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub window_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct UsageView {
    pub tier: PlanTier,
    pub quota: QuotaView,
    pub metered: Vec<FeatureUsage>,
}

async fn get_usage(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AdmissionContext>,
) -> Result<ApiResponse<UsageView>> {
    let limits = state.config.tier_limits.get(ctx.tier);
    let used = state
        .stores
        .rate_limits
        .get(&keys::rate_limit(&ctx.actor_key, &ctx.endpoint_class))
        .await?
        .unwrap_or(0);
    let metered = metered_usage(state.stores.rate_limits.as_ref(), &ctx.actor_key, ctx.tier).await?;

    Ok(ApiResponse::ok(UsageView {
        tier: ctx.tier,
        quota: QuotaView {
            limit: limits.max,
            used,
            remaining: limits.max.saturating_sub(used),
            window_secs: limits.window.as_secs(),
        },
        metered,
    }))
}

fn parse_feature(raw: &str) -> Result<Feature> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("feature {raw}")))
}

#[derive(Debug, Serialize)]
pub struct FeatureAccess {
    pub feature: Feature,
    pub available: bool,
}

async fn check_feature(
    Extension(ctx): Extension<AdmissionContext>,
    Path(feature): Path<String>,
) -> Result<ApiResponse<FeatureAccess>> {
    let feature = parse_feature(&feature)?;
    FeatureGuard(feature).check(&ctx).await?;

    Ok(ApiResponse::ok(FeatureAccess {
        feature,
        available: true,
    }))
}

#[derive(Debug, Serialize)]
pub struct FeatureUse {
    pub feature: Feature,
    /// Present when the feature is metered on the caller's tier
    pub usage: Option<FeatureUsage>,
}

/// Record one use of a metered feature.
async fn use_feature(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AdmissionContext>,
    Path(feature): Path<String>,
) -> Result<ApiResponse<FeatureUse>> {
    let feature = parse_feature(&feature)?;
    let store = state.stores.rate_limits.clone();

    let pipeline = AdmissionPipeline::new()
        .with_guard(FeatureGuard(feature))
        .with_guard(UsageGuard::new(
            store.clone(),
            feature,
            state.config.rate_limit_failure_policy,
        ));
    if let Some(denial) = pipeline.run(&ctx).await.denial {
        return Err(denial);
    }

    let usage = metered_usage(store.as_ref(), &ctx.actor_key, ctx.tier)
        .await?
        .into_iter()
        .find(|u| u.feature == feature);

    tracing::debug!(user_id = %ctx.user_id, feature = %feature, "Feature use recorded");

    Ok(ApiResponse::ok(FeatureUse { feature, usage }))
}
