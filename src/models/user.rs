// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User model for storage and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PlanTier;

/// User account, keyed by `id` and linked to a Google subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Stable Google account identifier (`sub`)
    pub google_subject: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    /// Only changed through an explicit tier change
    pub tier: PlanTier,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub tier_changed_at: Option<DateTime<Utc>>,
}

/// Profile returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderProfile {
    #[serde(rename = "sub")]
    pub subject: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl User {
    /// New account from a first login. Everyone starts on FREE.
    pub fn from_profile(profile: &ProviderProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            google_subject: profile.subject.clone(),
            email: profile.email.clone(),
            name: profile.name.clone(),
            picture: profile.picture.clone(),
            tier: PlanTier::Free,
            created_at: now,
            last_login_at: now,
            tier_changed_at: None,
        }
    }

    /// Refresh profile fields on a repeat login. The tier is left alone.
    pub fn apply_profile(&mut self, profile: &ProviderProfile, now: DateTime<Utc>) {
        self.email = profile.email.clone();
        self.name = profile.name.clone();
        self.picture = profile.picture.clone();
        self.last_login_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProviderProfile {
        ProviderProfile {
            subject: "1234".to_string(),
            email: "ada@example.com".to_string(),
            email_verified: Some(true),
            name: Some("Ada".to_string()),
            picture: None,
        }
    }

    #[test]
    fn test_new_users_start_free() {
        let user = User::from_profile(&profile(), Utc::now());
        assert_eq!(user.tier, PlanTier::Free);
        assert_eq!(user.google_subject, "1234");
        assert!(user.tier_changed_at.is_none());
    }

    #[test]
    fn test_apply_profile_keeps_tier() {
        let mut user = User::from_profile(&profile(), Utc::now());
        user.tier = PlanTier::Pro;

        let mut updated = profile();
        updated.email = "ada@new.example.com".to_string();
        user.apply_profile(&updated, Utc::now());

        assert_eq!(user.tier, PlanTier::Pro);
        assert_eq!(user.email, "ada@new.example.com");
    }
}
