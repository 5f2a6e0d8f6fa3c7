// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Redis storage backend, shared by every instance of the service.
//!
//! Each compare-and-set is a single server-side step: counters go through
//! one Lua round trip, and "mark used" / "mark revoked" are `SET NX` on a
//! companion key. Records themselves are JSON with a PX expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use super::{
    check_code_verifier, keys, OAuthStateRepository, RateLimitStore, RefreshTokenRepository,
    StoreError, UserRepository, WindowCount, EXPIRED_STATE_GRACE, STATE_TOKEN_BYTES,
};
use crate::crypto_utils::random_url_token;
use crate::models::{
    ConsumeOutcome, OAuthState, PlanTier, ProviderProfile, RefreshTokenRecord, RevokeOutcome,
    User,
};
use crate::time_utils::{millis_at_least_one, to_chrono};

/// INCR and, on the first hit of a window, PEXPIRE. Returns {count, pttl}.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// DECR only while the counted window is alive and above zero. A window
/// with more than ARGV[1] ms left was opened after the count was taken.
const DECREMENT_SCRIPT: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 or ttl > tonumber(ARGV[1]) then
  return 0
end
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count > 0 then
  redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Claim a state: {0, '', ''} not found, {1, json, ''} claimed,
/// {2, json, used_at} already claimed.
const CONSUME_STATE_SCRIPT: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state then
  return {0, '', ''}
end
local claimed = redis.call('SET', KEYS[2], ARGV[1], 'NX', 'PX', ARGV[2])
if not claimed then
  return {2, state, redis.call('GET', KEYS[2]) or ''}
end
return {1, state, ARGV[1]}
"#;

/// Claim a refresh token for revocation, same shape as the state claim.
const REVOKE_TOKEN_SCRIPT: &str = r#"
local record = redis.call('GET', KEYS[1])
if not record then
  return {0, '', ''}
end
local claimed = redis.call('SET', KEYS[2], ARGV[1], 'NX', 'PX', ARGV[2])
if not claimed then
  return {2, record, redis.call('GET', KEYS[2]) or ''}
end
return {1, record, ARGV[1]}
"#;

/// Claim the subject for ARGV[1] unless already claimed, refresh the profile
/// fields and fill any missing identity fields, all in one step. Returns the
/// user hash.
const UPSERT_USER_SCRIPT: &str = r#"
local id = redis.call('GET', KEYS[1])
if not id then
  id = ARGV[1]
  redis.call('SET', KEYS[1], id)
end
local key = ARGV[2] .. id
redis.call('HSET', key, 'email', ARGV[3], 'name', ARGV[4], 'picture', ARGV[5], 'last_login_at', ARGV[6])
redis.call('HSETNX', key, 'id', id)
redis.call('HSETNX', key, 'google_subject', ARGV[7])
redis.call('HSETNX', key, 'tier', ARGV[8])
redis.call('HSETNX', key, 'created_at', ARGV[6])
return redis.call('HGETALL', key)
"#;

/// Redis-backed store implementing every repository interface.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    oauth_state_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    pub async fn connect(
        url: &str,
        oauth_state_ttl: Duration,
        refresh_token_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        tracing::info!("Connected to Redis state backend");

        Ok(Self {
            connection_manager,
            oauth_state_ttl,
            refresh_token_ttl,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        value.map(|json| decode_json(key, &json)).transpose()
    }

    async fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        value.map(|raw| decode_timestamp(key, &raw)).transpose()
    }

    async fn store_state(&self, state: &OAuthState) -> Result<(), StoreError> {
        let ttl = state_ttl(state);
        let json = encode_json(&keys::oauth_state(&state.state_token), state)?;

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(keys::oauth_state(&state.state_token))
            .arg(json)
            .arg("PX")
            .arg(ttl)
            .ignore()
            .cmd("SET")
            .arg(keys::oauth_state_id(state.id))
            .arg(&state.state_token)
            .arg("PX")
            .arg(ttl)
            .ignore()
            .query_async::<()>(&mut self.conn())
            .await?;

        Ok(())
    }

    async fn revoke_many(&self, hashes: Vec<String>) -> Result<usize, StoreError> {
        let mut revoked = 0;
        for hash in hashes {
            if let RevokeOutcome::Revoked(_) = self.revoke_refresh_token(&hash).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

/// State records outlive their expiry by the grace period.
fn state_ttl(state: &OAuthState) -> u64 {
    let remaining = (state.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    millis_at_least_one(remaining + EXPIRED_STATE_GRACE)
}

fn encode_json<T: serde::Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(key: &str, json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_timestamp(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let (count, ttl_ms): (u64, i64) = Script::new(INCREMENT_SCRIPT)
            .key(key)
            .arg(millis_at_least_one(window))
            .invoke_async(&mut self.conn())
            .await?;

        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(ttl_ms.max(0).unsigned_abs()),
        })
    }

    async fn decrement(&self, key: &str, counted_resets_in: Duration) -> Result<(), StoreError> {
        Script::new(DECREMENT_SCRIPT)
            .key(key)
            .arg(millis_at_least_one(counted_resets_in))
            .invoke_async::<i64>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }
}

#[async_trait]
impl OAuthStateRepository for RedisStore {
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

        self.store_state(&state).await?;
        Ok(state)
    }

    async fn find_state_by_token(&self, token: &str) -> Result<Option<OAuthState>, StoreError> {
        let Some(mut state) = self.get_json::<OAuthState>(&keys::oauth_state(token)).await? else {
            return Ok(None);
        };
        state.used_at = self.get_timestamp(&keys::oauth_state_used(token)).await?;
        Ok(Some(state))
    }

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let id_key = keys::oauth_state_id(id);
        let token: Option<String> = conn.get(&id_key).await?;

        let mut to_delete = vec![id_key];
        if let Some(token) = token {
            to_delete.push(keys::oauth_state(&token));
            to_delete.push(keys::oauth_state_used(&token));
        }
        let _: i64 = conn.del(to_delete).await?;
        Ok(())
    }

    async fn consume_state(&self, token: &str) -> Result<ConsumeOutcome, StoreError> {
        let now = Utc::now();
        let state_key = keys::oauth_state(token);

        let (status, json, used_at): (i64, String, String) = Script::new(CONSUME_STATE_SCRIPT)
            .key(&state_key)
            .key(keys::oauth_state_used(token))
            .arg(now.to_rfc3339())
            .arg(millis_at_least_one(used_marker_ttl(self.oauth_state_ttl)))
            .invoke_async(&mut self.conn())
            .await?;

        if status == 0 {
            return Ok(ConsumeOutcome::NotFound);
        }

        let mut state: OAuthState = decode_json(&state_key, &json)?;

        if status == 2 {
            state.used_at = Some(decode_timestamp(&state_key, &used_at)?);
            return Ok(ConsumeOutcome::AlreadyUsed(state));
        }

        // The claim is already taken; an expired state stays dead either way.
        if state.is_expired_at(now) {
            return Ok(ConsumeOutcome::Expired(state));
        }

        state.used_at = Some(now);
        Ok(ConsumeOutcome::Consumed(state))
    }
}

/// The used-marker only has to outlive the state record.
fn used_marker_ttl(ttl: Duration) -> Duration {
    ttl + EXPIRED_STATE_GRACE
}

#[async_trait]
impl RefreshTokenRepository for RedisStore {
    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        let key = keys::refresh_token(&record.token_hash);
        let json = encode_json(&key, record)?;
        let ttl = millis_at_least_one(self.refresh_token_ttl);

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("PX")
            .arg(ttl)
            .ignore()
            .cmd("SADD")
            .arg(keys::refresh_user(record.user_id))
            .arg(&record.token_hash)
            .ignore()
            .cmd("PEXPIRE")
            .arg(keys::refresh_user(record.user_id))
            .arg(ttl)
            .ignore()
            .cmd("SADD")
            .arg(keys::refresh_family(record.family))
            .arg(&record.token_hash)
            .ignore()
            .cmd("PEXPIRE")
            .arg(keys::refresh_family(record.family))
            .arg(ttl)
            .ignore()
            .query_async::<()>(&mut self.conn())
            .await?;

        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let Some(mut record) = self
            .get_json::<RefreshTokenRecord>(&keys::refresh_token(token_hash))
            .await?
        else {
            return Ok(None);
        };
        record.revoked_at = self
            .get_timestamp(&keys::refresh_token_revoked(token_hash))
            .await?;
        Ok(Some(record))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<RevokeOutcome, StoreError> {
        let now = Utc::now();
        let key = keys::refresh_token(token_hash);

        let (status, json, revoked_at): (i64, String, String) = Script::new(REVOKE_TOKEN_SCRIPT)
            .key(&key)
            .key(keys::refresh_token_revoked(token_hash))
            .arg(now.to_rfc3339())
            .arg(millis_at_least_one(self.refresh_token_ttl))
            .invoke_async(&mut self.conn())
            .await?;

        if status == 0 {
            return Ok(RevokeOutcome::NotFound);
        }

        let mut record: RefreshTokenRecord = decode_json(&key, &json)?;
        if status == 2 {
            record.revoked_at = Some(decode_timestamp(&key, &revoked_at)?);
            return Ok(RevokeOutcome::AlreadyRevoked(record));
        }

        record.revoked_at = Some(now);
        Ok(RevokeOutcome::Revoked(record))
    }

    async fn revoke_family(&self, family: Uuid) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let hashes: Vec<String> = conn.smembers(keys::refresh_family(family)).await?;
        self.revoke_many(hashes).await
    }

    async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let hashes: Vec<String> = conn.smembers(keys::refresh_user(user_id)).await?;
        self.revoke_many(hashes).await
    }
}

// Users are hashes so that a login refreshing profile fields and a tier
// change touch disjoint fields and cannot overwrite each other.

fn user_from_hash(key: &str, fields: &HashMap<String, String>) -> Result<User, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };
    let optional = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

    Ok(User {
        id: field("id")?
            .parse()
            .map_err(|e: uuid::Error| corrupt(e.to_string()))?,
        google_subject: field("google_subject")?,
        email: field("email")?,
        name: optional("name"),
        picture: optional("picture"),
        tier: field("tier")?
            .parse()
            .map_err(|e: crate::models::plan::UnknownTier| corrupt(e.to_string()))?,
        created_at: decode_timestamp(key, &field("created_at")?)?,
        last_login_at: decode_timestamp(key, &field("last_login_at")?)?,
        tier_changed_at: optional("tier_changed_at")
            .map(|raw| decode_timestamp(key, &raw))
            .transpose()?,
    })
}

#[async_trait]
impl UserRepository for RedisStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let key = keys::user(id);
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        user_from_hash(&key, &fields).map(Some)
    }

    async fn upsert_from_profile(&self, profile: &ProviderProfile) -> Result<User, StoreError> {
        let now = Utc::now().to_rfc3339();
        let subject_key = keys::user_subject(&profile.subject);

        // Concurrent first logins race on the subject claim inside the
        // script; every caller gets the winner's complete hash.
        let candidate = Uuid::new_v4();
        let fields: HashMap<String, String> = Script::new(UPSERT_USER_SCRIPT)
            .key(&subject_key)
            .arg(candidate.to_string())
            .arg(keys::USER_PREFIX)
            .arg(&profile.email)
            .arg(profile.name.as_deref().unwrap_or_default())
            .arg(profile.picture.as_deref().unwrap_or_default())
            .arg(&now)
            .arg(&profile.subject)
            .arg(PlanTier::Free.to_string())
            .invoke_async(&mut self.conn())
            .await?;

        user_from_hash(&subject_key, &fields)
    }

    async fn set_tier(&self, id: Uuid, tier: PlanTier) -> Result<Option<User>, StoreError> {
        let Some(current) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        if current.tier == tier {
            return Ok(Some(current));
        }

        let mut conn = self.conn();
        let fields = [
            ("tier", tier.to_string()),
            ("tier_changed_at", Utc::now().to_rfc3339()),
        ];
        let _: () = conn.hset_multiple(keys::user(id), fields.as_slice()).await?;

        self.find_by_id(id).await
    }
}
