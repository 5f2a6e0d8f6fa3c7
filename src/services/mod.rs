// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod admission;
pub mod google;
pub mod oauth;
pub mod pkce;
pub mod session;

pub use admission::{
    AdmissionContext, AdmissionDecision, AdmissionPipeline, FeatureGuard, Guard, GuardOutcome,
    MinimumTierGuard, QuotaGuard, QuotaSnapshot, UsageGuard,
};
pub use google::{GoogleProvider, IdentityProvider, ProviderError, ProviderTokens};
pub use oauth::{AuthorizationRequest, LoginResult, LoginThrottle, OAuthService};
pub use session::{Claims, SessionService};
