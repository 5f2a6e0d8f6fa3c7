// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Storage layer: the narrow interfaces every caller goes through, plus the
//! in-memory and Redis backends behind them.
//!
//! The in-memory backend is only correct for a single instance. Anything
//! horizontally scaled must use Redis so that an OAuth flow started on one
//! instance can be completed on another and quotas are shared.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::models::{
    ConsumeOutcome, OAuthState, PlanTier, ProviderProfile, RefreshTokenRecord, RevokeOutcome,
    User,
};
use crate::services::pkce::{is_valid_code_verifier, MAX_VERIFIER_LEN, MIN_VERIFIER_LEN};

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("refusing to store {what}: {reason}")]
    Rejected { what: &'static str, reason: String },
}

/// Refuse to persist a flow whose verifier could never pass a PKCE check.
fn check_code_verifier(code_verifier: &str) -> Result<(), StoreError> {
    if is_valid_code_verifier(code_verifier) {
        return Ok(());
    }
    Err(StoreError::Rejected {
        what: "oauth state",
        reason: format!(
            "code verifier must be {MIN_VERIFIER_LEN}..={MAX_VERIFIER_LEN} unreserved characters, got {} bytes",
            code_verifier.len()
        ),
    })
}

/// Counter value after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    /// Time until the current window closes
    pub resets_in: Duration,
}

/// Fixed-window request counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically add one to `key`'s current window, opening a new window
    /// with count 1 if there is none or the old one has expired.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Take back one count from the window an earlier `increment` reported
    /// as closing in `counted_resets_in`. A no-op once that window has
    /// closed, even if a newer one has opened under the same key.
    async fn decrement(&self, key: &str, counted_resets_in: Duration) -> Result<(), StoreError>;

    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Count in the current window, `None` if no window is open.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Drop expired windows. Backends with native expiry do nothing.
    async fn purge_expired(&self) -> usize {
        0
    }
}

/// Short-lived storage for started OAuth flows.
#[async_trait]
pub trait OAuthStateRepository: Send + Sync {
    /// Persist a new flow with a fresh random state token and id. Rejects a
    /// verifier outside RFC 7636's shape.
    async fn create_state(
        &self,
        redirect_to: Url,
        code_verifier: String,
    ) -> Result<OAuthState, StoreError>;

    async fn find_state_by_token(&self, token: &str) -> Result<Option<OAuthState>, StoreError>;

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError>;

    /// Compare-and-set `used_at`: of any number of concurrent calls with the
    /// same token, exactly one sees `Consumed`.
    async fn consume_state(&self, token: &str) -> Result<ConsumeOutcome, StoreError>;

    async fn purge_expired(&self) -> usize {
        0
    }
}

/// Refresh token records, looked up by keyed hash.
#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError>;

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Compare-and-set `revoked_at`; exactly one concurrent caller wins.
    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<RevokeOutcome, StoreError>;

    /// Revoke every token in a rotation family. Returns how many were active.
    async fn revoke_family(&self, family: Uuid) -> Result<usize, StoreError>;

    /// Revoke every refresh token of a user (breach response).
    async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<usize, StoreError>;

    async fn purge_expired(&self) -> usize {
        0
    }
}

/// User accounts.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Create the account on first login, otherwise refresh profile fields.
    /// Never changes the tier.
    async fn upsert_from_profile(&self, profile: &ProviderProfile) -> Result<User, StoreError>;

    /// Explicit plan change. `None` if the user does not exist.
    async fn set_tier(&self, id: Uuid, tier: PlanTier) -> Result<Option<User>, StoreError>;
}

/// Key naming for the shared store.
pub mod keys {
    use uuid::Uuid;

    pub fn rate_limit(actor: &str, endpoint_class: &str) -> String {
        format!("ratelimit:{actor}:{endpoint_class}")
    }

    pub fn login_attempts(client: &str) -> String {
        format!("ratelimit:login:{client}")
    }

    pub fn usage(actor: &str, feature: &str) -> String {
        format!("usage:{actor}:{feature}")
    }

    pub fn oauth_state(token: &str) -> String {
        format!("oauth:state:{token}")
    }

    pub fn oauth_state_used(token: &str) -> String {
        format!("oauth:state:{token}:used")
    }

    pub fn oauth_state_id(id: Uuid) -> String {
        format!("oauth:state:id:{id}")
    }

    pub fn refresh_token(hash: &str) -> String {
        format!("refresh:{hash}")
    }

    pub fn refresh_token_revoked(hash: &str) -> String {
        format!("refresh:{hash}:revoked")
    }

    pub fn refresh_family(family: Uuid) -> String {
        format!("refresh:family:{family}")
    }

    pub fn refresh_user(user_id: Uuid) -> String {
        format!("refresh:user:{user_id}")
    }

    pub const USER_PREFIX: &str = "user:";

    pub fn user(id: Uuid) -> String {
        format!("{USER_PREFIX}{id}")
    }

    pub fn user_subject(subject: &str) -> String {
        format!("user:subject:{subject}")
    }
}

/// Length in bytes of random OAuth state tokens before encoding.
pub const STATE_TOKEN_BYTES: usize = 32;

/// How long expired OAuth states stay around so a late callback is reported
/// as expired rather than unknown.
pub const EXPIRED_STATE_GRACE: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        let id = Uuid::nil();
        assert_eq!(keys::rate_limit("user:1", "api"), "ratelimit:user:1:api");
        assert_eq!(keys::login_attempts("10.0.0.1"), "ratelimit:login:10.0.0.1");
        assert_eq!(keys::oauth_state("abc"), "oauth:state:abc");
        assert_eq!(keys::oauth_state_used("abc"), "oauth:state:abc:used");
        assert_eq!(
            keys::oauth_state_id(id),
            "oauth:state:id:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys::usage("user:1", "ai_assistant"), "usage:user:1:ai_assistant");
    }
}
