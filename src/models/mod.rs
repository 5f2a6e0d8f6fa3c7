// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod oauth_state;
pub mod plan;
pub mod session;
pub mod user;

pub use oauth_state::{ConsumeOutcome, OAuthState};
pub use plan::{
    tier_features, tier_has_feature, tier_limits, usage_quota, Feature, PlanTier, TierLimitTable,
    TierLimits, UsageQuota,
};
pub use session::{RefreshTokenRecord, RevokeOutcome, TokenPair};
pub use user::{ProviderProfile, User};
