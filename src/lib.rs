// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! tiergate: plan-tier admission control and Google sign-in (PKCE)
//!
//! This crate provides the backend API that signs users in with Google,
//! issues session tokens and admits requests according to the caller's
//! subscription tier.

pub mod config;
pub mod crypto_utils;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod response;
pub mod routes;
pub mod services;
pub mod time_utils;

use std::sync::Arc;
use std::time::Duration;

use config::{Config, StateBackend};
use db::{
    MemoryStore, OAuthStateRepository, RateLimitStore, RedisStore, RefreshTokenRepository,
    UserRepository,
};
use services::{
    AdmissionPipeline, GoogleProvider, IdentityProvider, LoginThrottle, OAuthService, QuotaGuard,
    SessionService,
};

/// Quota bucket for the authenticated API.
pub const API_ENDPOINT_CLASS: &str = "api";

/// The storage backends, each behind its narrow interface.
#[derive(Clone)]
pub struct Stores {
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub oauth_states: Arc<dyn OAuthStateRepository>,
    pub users: Arc<dyn UserRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
}

impl Stores {
    /// Everything in one process-local store.
    pub fn memory(config: &Config) -> Self {
        let store = Arc::new(MemoryStore::new(config.oauth_state_ttl));
        Self {
            rate_limits: store.clone(),
            oauth_states: store.clone(),
            users: store.clone(),
            refresh_tokens: store,
        }
    }

    pub async fn redis(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(
            RedisStore::connect(
                &config.redis_url,
                config.oauth_state_ttl,
                config.refresh_token_ttl,
            )
            .await?,
        );
        Ok(Self {
            rate_limits: store.clone(),
            oauth_states: store.clone(),
            users: store.clone(),
            refresh_tokens: store,
        })
    }

    /// The backend selected by `STATE_BACKEND`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.state_backend {
            StateBackend::Memory => {
                tracing::warn!(
                    "Using in-memory state backend; not safe with more than one instance"
                );
                Ok(Self::memory(config))
            }
            StateBackend::Redis => Self::redis(config).await,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub stores: Stores,
    pub sessions: Arc<SessionService>,
    pub oauth: OAuthService,
    pub login_throttle: LoginThrottle,
    /// Guards every `/api` request runs through
    pub api_pipeline: AdmissionPipeline,
}

impl AppState {
    /// Composition root: wire services over the given stores and provider.
    pub fn new(
        config: Config,
        stores: Stores,
        provider: Arc<dyn IdentityProvider>,
    ) -> anyhow::Result<Self> {
        let sessions = Arc::new(SessionService::new(
            &config,
            stores.refresh_tokens.clone(),
            stores.users.clone(),
        )?);

        let oauth = OAuthService::new(
            &config,
            stores.oauth_states.clone(),
            provider,
            stores.users.clone(),
            sessions.clone(),
        );

        let login_throttle =
            LoginThrottle::new(stores.rate_limits.clone(), config.rate_limit_failure_policy);

        let api_pipeline = AdmissionPipeline::new().with_guard(QuotaGuard::new(
            stores.rate_limits.clone(),
            config.tier_limits.clone(),
            config.rate_limit_failure_policy,
        ));

        Ok(Self {
            config,
            stores,
            sessions,
            oauth,
            login_throttle,
            api_pipeline,
        })
    }

    /// Production wiring: configured backend and the real Google client.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let stores = Stores::from_config(&config).await?;
        let provider = Arc::new(GoogleProvider::new(&config)?);
        Self::new(config, stores, provider)
    }
}

/// Periodically drop expired entries from backends without native expiry.
pub fn spawn_store_gc(stores: Stores, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let windows = stores.rate_limits.purge_expired().await;
            let states = stores.oauth_states.purge_expired().await;
            let refresh_tokens = stores.refresh_tokens.purge_expired().await;
            if windows + states + refresh_tokens > 0 {
                tracing::debug!(windows, states, refresh_tokens, "Purged expired entries");
            }
        }
    })
}
