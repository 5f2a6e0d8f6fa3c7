// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory storage backend for development and single-instance deployments.
//!
//! Every read-modify-write happens while holding the `DashMap` entry guard
//! for that key, so concurrent callers on the same key are serialized and no
//! update is lost. Rate-limit windows use `tokio::time::Instant`, which lets
//! tests drive expiry with a paused clock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use super::{
    check_code_verifier, OAuthStateRepository, RateLimitStore, RefreshTokenRepository, StoreError,
    UserRepository, WindowCount, EXPIRED_STATE_GRACE, STATE_TOKEN_BYTES,
};
use crate::crypto_utils::random_url_token;
use crate::models::{
    ConsumeOutcome, OAuthState, PlanTier, ProviderProfile, RefreshTokenRecord, RevokeOutcome,
    User,
};
use crate::time_utils::to_chrono;

/// One actor's counter for the current fixed window.
#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    window_start: Instant,
    window: Duration,
    count: u64,
}

impl RateLimitWindow {
    fn is_expired_at(&self, now: Instant) -> bool {
        now > self.window_start + self.window
    }

    fn resets_in(&self, now: Instant) -> Duration {
        (self.window_start + self.window).saturating_duration_since(now)
    }
}

/// Process-local store implementing every repository interface.
pub struct MemoryStore {
    oauth_state_ttl: Duration,
    windows: DashMap<String, RateLimitWindow>,
    /// state token -> state
    states: DashMap<String, OAuthState>,
    /// state id -> state token
    state_ids: DashMap<Uuid, String>,
    /// token hash -> record
    refresh_tokens: DashMap<String, RefreshTokenRecord>,
    users: DashMap<Uuid, User>,
    /// Google subject -> user id
    users_by_subject: DashMap<String, Uuid>,
}

impl MemoryStore {
    pub fn new(oauth_state_ttl: Duration) -> Self {
        Self {
            oauth_state_ttl,
            windows: DashMap::new(),
            states: DashMap::new(),
            state_ids: DashMap::new(),
            refresh_tokens: DashMap::new(),
            users: DashMap::new(),
            users_by_subject: DashMap::new(),
        }
    }

    /// Replace a stored state wholesale. Intended for tests and tooling.
    pub fn put_state(&self, state: OAuthState) {
        self.state_ids.insert(state.id, state.state_token.clone());
        self.states.insert(state.state_token.clone(), state);
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(RateLimitWindow {
                window_start: now,
                window,
                count: 0,
            });

        if entry.is_expired_at(now) {
            *entry = RateLimitWindow {
                window_start: now,
                window,
                count: 0,
            };
        }

        entry.count += 1;

        Ok(WindowCount {
            count: entry.count,
            resets_in: entry.resets_in(now),
        })
    }

    async fn decrement(&self, key: &str, counted_resets_in: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut entry) = self.windows.get_mut(key) {
            // A window opened after the count closes later than the counted one did.
            if !entry.is_expired_at(now) && entry.resets_in(now) <= counted_resets_in {
                entry.count = entry.count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|w| !w.is_expired_at(now))
            .map(|w| w.count))
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired_at(now));
        before.saturating_sub(self.windows.len())
    }
}

#[async_trait]
impl OAuthStateRepository for MemoryStore {
    async fn create_state(
        &self,
        redirect_to: Url,
        code_verifier: String,
    ) -> Result<OAuthState, StoreError> {
        check_code_verifier(&code_verifier)?;
        let now = Utc::now();
        let state = OAuthState {
            id: Uuid::new_v4(),
            state_token: random_url_token(STATE_TOKEN_BYTES),
            redirect_to,
            code_verifier,
            created_at: now,
            expires_at: now + to_chrono(self.oauth_state_ttl),
            used_at: None,
        };

        self.put_state(state.clone());
        Ok(state)
    }

    async fn find_state_by_token(&self, token: &str) -> Result<Option<OAuthState>, StoreError> {
        Ok(self.states.get(token).map(|s| s.value().clone()))
    }

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some((_, token)) = self.state_ids.remove(&id) {
            self.states.remove(&token);
        }
        Ok(())
    }

    async fn consume_state(&self, token: &str) -> Result<ConsumeOutcome, StoreError> {
        let now = Utc::now();

        let Some(mut state) = self.states.get_mut(token) else {
            return Ok(ConsumeOutcome::NotFound);
        };

        if state.used_at.is_some() {
            return Ok(ConsumeOutcome::AlreadyUsed(state.clone()));
        }
        if state.is_expired_at(now) {
            return Ok(ConsumeOutcome::Expired(state.clone()));
        }

        state.used_at = Some(now);
        Ok(ConsumeOutcome::Consumed(state.clone()))
    }

    async fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - to_chrono(EXPIRED_STATE_GRACE);
        let before = self.states.len();
        self.states.retain(|_, s| s.expires_at > cutoff);
        self.state_ids
            .retain(|_, token| self.states.contains_key(token.as_str()));
        before.saturating_sub(self.states.len())
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        self.refresh_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self.refresh_tokens.get(token_hash).map(|r| r.value().clone()))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<RevokeOutcome, StoreError> {
        let Some(mut record) = self.refresh_tokens.get_mut(token_hash) else {
            return Ok(RevokeOutcome::NotFound);
        };

        if record.revoked_at.is_some() {
            return Ok(RevokeOutcome::AlreadyRevoked(record.clone()));
        }

        record.revoked_at = Some(Utc::now());
        Ok(RevokeOutcome::Revoked(record.clone()))
    }

    async fn revoke_family(&self, family: Uuid) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut revoked = 0;
        for mut record in self.refresh_tokens.iter_mut() {
            if record.family == family && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut revoked = 0;
        for mut record in self.refresh_tokens.iter_mut() {
            if record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.refresh_tokens.len();
        self.refresh_tokens.retain(|_, r| r.expires_at > now);
        before.saturating_sub(self.refresh_tokens.len())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn upsert_from_profile(&self, profile: &ProviderProfile) -> Result<User, StoreError> {
        let now = Utc::now();

        // The subject entry guard serializes first logins of the same account.
        let user_id = match self.users_by_subject.entry(profile.subject.clone()) {
            Entry::Occupied(existing) => *existing.get(),
            Entry::Vacant(vacant) => {
                let user = User::from_profile(profile, now);
                let id = user.id;
                self.users.insert(id, user.clone());
                vacant.insert(id);
                return Ok(user);
            }
        };

        match self.users.get_mut(&user_id) {
            Some(mut user) => {
                user.apply_profile(profile, now);
                Ok(user.clone())
            }
            None => Err(StoreError::Corrupt {
                key: profile.subject.clone(),
                reason: format!("subject index points at missing user {user_id}"),
            }),
        }
    }

    async fn set_tier(&self, id: Uuid, tier: PlanTier) -> Result<Option<User>, StoreError> {
        Ok(self.users.get_mut(&id).map(|mut user| {
            if user.tier != tier {
                user.tier = tier;
                user.tier_changed_at = Some(Utc::now());
            }
            user.clone()
        }))
    }
}
