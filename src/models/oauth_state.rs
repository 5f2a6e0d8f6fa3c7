// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pending OAuth authorization (PKCE verifier + CSRF state token).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// A started OAuth flow waiting for its callback.
///
/// Created once, marked used at most once, never modified otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub id: Uuid,
    /// Random, unguessable token sent to the provider as `state`
    pub state_token: String,
    /// Validated post-login destination
    pub redirect_to: Url,
    /// PKCE code verifier (43-128 chars)
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl OAuthState {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now <= self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of atomically claiming a state token for a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This caller won the claim; `used_at` is now set.
    Consumed(OAuthState),
    NotFound,
    Expired(OAuthState),
    AlreadyUsed(OAuthState),
}
