// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Request admission: an ordered list of guards, first denial wins.
//!
//! Guards only see the resolved [`AdmissionContext`]. The quota guard counts
//! in fixed windows through the [`RateLimitStore`]; the feature guard is a
//! pure capability lookup; the usage guard meters individual features over
//! a long window.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::RateLimitFailurePolicy;
use crate::db::{keys, RateLimitStore, StoreError};
use crate::error::AppError;
use crate::models::{tier_has_feature, usage_quota, Feature, PlanTier, TierLimitTable};

/// Everything a guard may look at.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub user_id: Uuid,
    pub tier: PlanTier,
    /// Who is being counted, e.g. `user:{id}`
    pub actor_key: String,
    /// Which quota bucket, e.g. `api`
    pub endpoint_class: String,
}

impl AdmissionContext {
    pub fn for_user(user_id: Uuid, tier: PlanTier, endpoint_class: &str) -> Self {
        Self {
            user_id,
            tier,
            actor_key: format!("user:{user_id}"),
            endpoint_class: endpoint_class.to_string(),
        }
    }
}

/// Quota state after a counted request, for `X-RateLimit-*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// Time left in the counted window when the count was taken. Also
    /// identifies that window when the count is taken back.
    pub resets_in: Duration,
    pub skip_failed_requests: bool,
    pub skip_successful_requests: bool,
}

impl QuotaSnapshot {
    /// Whole seconds until the window resets, rounded up.
    pub fn reset_secs(&self) -> u64 {
        self.resets_in.as_secs() + u64::from(self.resets_in.subsec_nanos() > 0)
    }

    /// Whether a response with `status` should be taken back off the count.
    pub fn should_uncount(&self, status: StatusCode) -> bool {
        let failed = status.is_client_error() || status.is_server_error();
        (failed && self.skip_failed_requests) || (!failed && self.skip_successful_requests)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Allow,
    /// Allowed and counted against a quota
    Counted(QuotaSnapshot),
}

#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` is a denial (or, under fail-closed, a store failure).
    async fn check(&self, ctx: &AdmissionContext) -> Result<GuardOutcome, AppError>;
}

/// Result of running a pipeline.
#[derive(Debug)]
pub struct AdmissionDecision {
    /// Last quota counted before the pipeline finished or stopped
    pub quota: Option<QuotaSnapshot>,
    pub denial: Option<AppError>,
}

/// Ordered guards. Evaluation stops at the first denial.
#[derive(Clone, Default)]
pub struct AdmissionPipeline {
    guards: Vec<Arc<dyn Guard>>,
}

impl AdmissionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(mut self, guard: impl Guard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn guard_names(&self) -> Vec<&'static str> {
        self.guards.iter().map(|g| g.name()).collect()
    }

    pub async fn run(&self, ctx: &AdmissionContext) -> AdmissionDecision {
        let mut quota = None;

        for guard in &self.guards {
            match guard.check(ctx).await {
                Ok(GuardOutcome::Allow) => {}
                Ok(GuardOutcome::Counted(snapshot)) => quota = Some(snapshot),
                Err(denial) => {
                    tracing::info!(
                        guard = guard.name(),
                        user_id = %ctx.user_id,
                        tier = %ctx.tier,
                        endpoint_class = %ctx.endpoint_class,
                        reason = denial.code(),
                        "Request denied by admission pipeline"
                    );
                    return AdmissionDecision {
                        quota,
                        denial: Some(denial),
                    };
                }
            }
        }

        AdmissionDecision {
            quota,
            denial: None,
        }
    }
}

fn store_failure(
    policy: RateLimitFailurePolicy,
    guard: &'static str,
    err: StoreError,
) -> Result<GuardOutcome, AppError> {
    match policy {
        RateLimitFailurePolicy::FailOpen => {
            tracing::warn!(guard, error = %err, "Rate limit store unavailable, failing open");
            Ok(GuardOutcome::Allow)
        }
        RateLimitFailurePolicy::FailClosed => {
            tracing::error!(guard, error = %err, "Rate limit store unavailable, failing closed");
            Err(AppError::StoreUnavailable(err))
        }
    }
}

/// Per-tier fixed-window request quota.
pub struct QuotaGuard {
    store: Arc<dyn RateLimitStore>,
    limits: TierLimitTable,
    policy: RateLimitFailurePolicy,
}

impl QuotaGuard {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        limits: TierLimitTable,
        policy: RateLimitFailurePolicy,
    ) -> Self {
        Self {
            store,
            limits,
            policy,
        }
    }
}

#[async_trait]
impl Guard for QuotaGuard {
    fn name(&self) -> &'static str {
        "quota"
    }

    async fn check(&self, ctx: &AdmissionContext) -> Result<GuardOutcome, AppError> {
        let limits = self.limits.get(ctx.tier);
        let key = keys::rate_limit(&ctx.actor_key, &ctx.endpoint_class);

        let counted = match self.store.increment(&key, limits.window).await {
            Ok(counted) => counted,
            Err(err) => return store_failure(self.policy, self.name(), err),
        };

        if counted.count > limits.max {
            return Err(AppError::RateLimitExceeded {
                limit: limits.max,
                retry_after: counted.resets_in,
            });
        }

        Ok(GuardOutcome::Counted(QuotaSnapshot {
            key,
            limit: limits.max,
            remaining: limits.max - counted.count,
            resets_in: counted.resets_in,
            skip_failed_requests: limits.skip_failed_requests,
            skip_successful_requests: limits.skip_successful_requests,
        }))
    }
}

/// Requires at least the given tier.
pub struct MinimumTierGuard(pub PlanTier);

#[async_trait]
impl Guard for MinimumTierGuard {
    fn name(&self) -> &'static str {
        "minimum_tier"
    }

    async fn check(&self, ctx: &AdmissionContext) -> Result<GuardOutcome, AppError> {
        if ctx.tier >= self.0 {
            Ok(GuardOutcome::Allow)
        } else {
            Err(AppError::TierRequired {
                required: self.0,
                current: ctx.tier,
            })
        }
    }
}

/// Requires the tier's capability table to include a feature.
pub struct FeatureGuard(pub Feature);

#[async_trait]
impl Guard for FeatureGuard {
    fn name(&self) -> &'static str {
        "feature"
    }

    async fn check(&self, ctx: &AdmissionContext) -> Result<GuardOutcome, AppError> {
        if tier_has_feature(ctx.tier, self.0) {
            Ok(GuardOutcome::Allow)
        } else {
            Err(AppError::FeatureNotAvailable {
                feature: self.0,
                tier: ctx.tier,
            })
        }
    }
}

/// Meters uses of a feature. Tiers without a quota for it pass uncounted.
pub struct UsageGuard {
    store: Arc<dyn RateLimitStore>,
    feature: Feature,
    policy: RateLimitFailurePolicy,
}

impl UsageGuard {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        feature: Feature,
        policy: RateLimitFailurePolicy,
    ) -> Self {
        Self {
            store,
            feature,
            policy,
        }
    }
}

#[async_trait]
impl Guard for UsageGuard {
    fn name(&self) -> &'static str {
        "usage"
    }

    async fn check(&self, ctx: &AdmissionContext) -> Result<GuardOutcome, AppError> {
        let Some(quota) = usage_quota(ctx.tier, self.feature) else {
            return Ok(GuardOutcome::Allow);
        };

        let key = keys::usage(&ctx.actor_key, self.feature.as_str());
        let counted = match self.store.increment(&key, quota.window).await {
            Ok(counted) => counted,
            Err(err) => return store_failure(self.policy, self.name(), err),
        };

        if counted.count > quota.max {
            return Err(AppError::UsageLimitExceeded {
                feature: self.feature,
                limit: quota.max,
                retry_after: counted.resets_in,
            });
        }

        Ok(GuardOutcome::Allow)
    }
}

/// Metered usage of one feature in the current period.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Current usage of every metered feature available to `tier`.
pub async fn metered_usage(
    store: &dyn RateLimitStore,
    actor_key: &str,
    tier: PlanTier,
) -> Result<Vec<FeatureUsage>, StoreError> {
    let mut usage = Vec::new();
    for feature in Feature::ALL {
        let Some(quota) = usage_quota(tier, feature) else {
            continue;
        };
        let used = store
            .get(&keys::usage(actor_key, feature.as_str()))
            .await?
            .unwrap_or(0);
        usage.push(FeatureUsage {
            feature,
            used,
            limit: quota.max,
            remaining: quota.max.saturating_sub(used),
        });
    }
    Ok(usage)
}
