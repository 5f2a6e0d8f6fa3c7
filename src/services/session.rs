// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session tokens: short-lived HS256 access JWTs plus opaque, rotating
//! refresh tokens.
//!
//! Only a keyed hash of each refresh token is stored. Rotation revokes the
//! presented token with a compare-and-set; presenting an already revoked
//! token means it leaked, so the whole rotation family is revoked.

use chrono::Utc;
use hkdf::Hkdf;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto_utils::{hmac_hex, random_url_token};
use crate::db::{RefreshTokenRepository, UserRepository};
use crate::error::{AppError, Result};
use crate::models::{PlanTier, RefreshTokenRecord, RevokeOutcome, TokenPair, User};
use crate::time_utils::to_chrono;

const HKDF_SALT: &[u8] = b"tiergate-session-v1";
const REFRESH_TOKEN_BYTES: usize = 32;
const JWT_LEEWAY_SECS: u64 = 5;

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Tier at issue time; informational, admission re-reads the user
    pub tier: PlanTier,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    pub jti: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        self.sub.parse().map_err(|_| AppError::InvalidToken)
    }
}

/// Issues, rotates and verifies session tokens.
pub struct SessionService {
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    users: Arc<dyn UserRepository>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    refresh_hash_key: [u8; 32],
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl SessionService {
    pub fn new(
        config: &Config,
        refresh_tokens: Arc<dyn RefreshTokenRepository>,
        users: Arc<dyn UserRepository>,
    ) -> anyhow::Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &config.session_secret);

        let mut jwt_key = [0u8; 32];
        hk.expand(b"access-token-signing", &mut jwt_key)
            .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
        let mut refresh_hash_key = [0u8; 32];
        hk.expand(b"refresh-token-hashing", &mut refresh_hash_key)
            .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;

        Ok(Self {
            refresh_tokens,
            users,
            encoding_key: EncodingKey::from_secret(&jwt_key),
            decoding_key: DecodingKey::from_secret(&jwt_key),
            refresh_hash_key,
            access_token_ttl: config.access_token_ttl,
            refresh_token_ttl: config.refresh_token_ttl,
        })
    }

    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    /// Start a new session (and a new rotation family) for `user`.
    pub async fn issue(&self, user: &User) -> Result<TokenPair> {
        self.issue_in_family(user, Uuid::new_v4()).await
    }

    async fn issue_in_family(&self, user: &User, family: Uuid) -> Result<TokenPair> {
        let access_token = self.create_access_token(user)?;

        let refresh_token = random_url_token(REFRESH_TOKEN_BYTES);
        let now = Utc::now();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            token_hash: self.hash_refresh_token(&refresh_token)?,
            family,
            created_at: now,
            expires_at: now + to_chrono(self.refresh_token_ttl),
            revoked_at: None,
        };
        self.refresh_tokens.store_refresh_token(&record).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_ttl.as_secs(),
        })
    }

    /// Exchange a refresh token for a new pair, revoking the old one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<(User, TokenPair)> {
        if refresh_token.is_empty() {
            return Err(AppError::InvalidToken);
        }
        let hash = self.hash_refresh_token(refresh_token)?;

        let record = match self.refresh_tokens.revoke_refresh_token(&hash).await? {
            RevokeOutcome::Revoked(record) => record,
            RevokeOutcome::NotFound => {
                tracing::debug!("Refresh with unknown token");
                return Err(AppError::InvalidToken);
            }
            RevokeOutcome::AlreadyRevoked(record) => {
                let revoked = self.refresh_tokens.revoke_family(record.family).await?;
                tracing::warn!(
                    user_id = %record.user_id,
                    family = %record.family,
                    revoked,
                    "Refresh token reuse detected, revoked token family"
                );
                return Err(AppError::InvalidToken);
            }
        };

        if Utc::now() > record.expires_at {
            tracing::debug!(user_id = %record.user_id, "Refresh with expired token");
            return Err(AppError::InvalidToken);
        }

        let user = self
            .users
            .find_by_id(record.user_id)
            .await?
            .ok_or(AppError::InvalidToken)?;

        let tokens = self.issue_in_family(&user, record.family).await?;
        tracing::debug!(user_id = %user.id, family = %record.family, "Refresh token rotated");

        Ok((user, tokens))
    }

    /// Revoke one refresh token (logout). Unknown tokens are ignored.
    pub async fn revoke(&self, refresh_token: &str) -> Result<()> {
        if refresh_token.is_empty() {
            return Ok(());
        }
        let hash = self.hash_refresh_token(refresh_token)?;
        self.refresh_tokens.revoke_refresh_token(&hash).await?;
        Ok(())
    }

    /// Revoke every refresh token of a user.
    ///
    /// Access tokens are stateless and are not touched: one issued before
    /// the call keeps working until it expires, at most `access_token_ttl`
    /// later. Only the ability to mint new ones ends here.
    pub async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let revoked = self.refresh_tokens.invalidate_all_for_user(user_id).await?;
        tracing::info!(user_id = %user_id, revoked, "Invalidated all sessions for user");
        Ok(revoked)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = JWT_LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AppError::InvalidToken
            })
    }

    fn create_access_token(&self, user: &User) -> Result<String> {
        let now = Utc::now().timestamp().max(0).unsigned_abs();
        let claims = Claims {
            sub: user.id.to_string(),
            tier: user.tier,
            iat: now,
            exp: now + self.access_token_ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JWT creation failed: {}", e)))
    }

    fn hash_refresh_token(&self, token: &str) -> Result<String> {
        Ok(hmac_hex(&self.refresh_hash_key, token)?)
    }
}
