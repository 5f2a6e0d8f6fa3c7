// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Subscription plan tiers, their request quotas and feature capabilities.
//!
//! Everything here is a static lookup over closed enums: no storage and no
//! failure modes. Gates read these tables; counters live in the rate-limit
//! store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

const HOUR: Duration = Duration::from_secs(60 * 60);
const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Subscription level attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum PlanTier {
    Free,
    Pro,
    Premium,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Free, PlanTier::Pro, PlanTier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "FREE",
            PlanTier::Pro => "PRO",
            PlanTier::Premium => "PREMIUM",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown plan tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for PlanTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(PlanTier::Free),
            "PRO" => Ok(PlanTier::Pro),
            "PREMIUM" => Ok(PlanTier::Premium),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Request quota for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub window: Duration,
    pub max: u64,
    /// Don't count responses with status >= 400 against the quota.
    pub skip_failed_requests: bool,
    /// Don't count responses with status < 400 against the quota.
    pub skip_successful_requests: bool,
}

/// Built-in quota for a tier.
pub fn tier_limits(tier: PlanTier) -> TierLimits {
    let max = match tier {
        PlanTier::Free => 100,
        PlanTier::Pro => 1_000,
        PlanTier::Premium => 999_999,
    };

    TierLimits {
        window: HOUR,
        max,
        skip_failed_requests: false,
        skip_successful_requests: false,
    }
}

/// Quota table used at runtime: the built-in registry plus any overrides
/// from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLimitTable {
    free: TierLimits,
    pro: TierLimits,
    premium: TierLimits,
}

impl Default for TierLimitTable {
    fn default() -> Self {
        Self {
            free: tier_limits(PlanTier::Free),
            pro: tier_limits(PlanTier::Pro),
            premium: tier_limits(PlanTier::Premium),
        }
    }
}

impl TierLimitTable {
    pub fn get(&self, tier: PlanTier) -> TierLimits {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
            PlanTier::Premium => self.premium,
        }
    }

    pub fn with_limits(mut self, tier: PlanTier, limits: TierLimits) -> Self {
        match tier {
            PlanTier::Free => self.free = limits,
            PlanTier::Pro => self.pro = limits,
            PlanTier::Premium => self.premium = limits,
        }
        self
    }

    pub fn with_max(self, tier: PlanTier, max: u64) -> Self {
        let limits = TierLimits {
            max,
            ..self.get(tier)
        };
        self.with_limits(tier, limits)
    }
}

/// Capabilities that plans unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum Feature {
    BasicLessons,
    CourseEnrollment,
    AiAssistant,
    Assessments,
    Analytics,
    AiCourseGeneration,
    PrioritySupport,
    CustomBranding,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::BasicLessons,
        Feature::CourseEnrollment,
        Feature::AiAssistant,
        Feature::Assessments,
        Feature::Analytics,
        Feature::AiCourseGeneration,
        Feature::PrioritySupport,
        Feature::CustomBranding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::BasicLessons => "basic_lessons",
            Feature::CourseEnrollment => "course_enrollment",
            Feature::AiAssistant => "ai_assistant",
            Feature::Assessments => "assessments",
            Feature::Analytics => "analytics",
            Feature::AiCourseGeneration => "ai_course_generation",
            Feature::PrioritySupport => "priority_support",
            Feature::CustomBranding => "custom_branding",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

const FREE_FEATURES: &[Feature] = &[Feature::BasicLessons, Feature::CourseEnrollment];

const PRO_FEATURES: &[Feature] = &[
    Feature::BasicLessons,
    Feature::CourseEnrollment,
    Feature::AiAssistant,
    Feature::Assessments,
    Feature::Analytics,
];

const PREMIUM_FEATURES: &[Feature] = &[
    Feature::BasicLessons,
    Feature::CourseEnrollment,
    Feature::AiAssistant,
    Feature::Assessments,
    Feature::Analytics,
    Feature::AiCourseGeneration,
    Feature::PrioritySupport,
    Feature::CustomBranding,
];

/// Features included in a tier.
pub fn tier_features(tier: PlanTier) -> &'static [Feature] {
    match tier {
        PlanTier::Free => FREE_FEATURES,
        PlanTier::Pro => PRO_FEATURES,
        PlanTier::Premium => PREMIUM_FEATURES,
    }
}

pub fn tier_has_feature(tier: PlanTier, feature: Feature) -> bool {
    tier_features(tier).contains(&feature)
}

/// Metered allowance for a feature, counted separately from request quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageQuota {
    pub window: Duration,
    pub max: u64,
}

/// Metered allowance for `feature` on `tier`. `None` means unmetered.
pub fn usage_quota(tier: PlanTier, feature: Feature) -> Option<UsageQuota> {
    let max = match (feature, tier) {
        (Feature::AiAssistant, PlanTier::Pro) => 200,
        (Feature::AiCourseGeneration, PlanTier::Premium) => 50,
        _ => return None,
    };

    Some(UsageQuota {
        window: THIRTY_DAYS,
        max,
    })
}
