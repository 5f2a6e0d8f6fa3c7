// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request};
use axum::response::Response;
use std::sync::Arc;
use tiergate::config::Config;
use tiergate::db::{MemoryStore, RateLimitStore, StoreError, WindowCount};
use tiergate::models::{PlanTier, ProviderProfile, TokenPair, User};
use tiergate::routes::create_router;
use tiergate::services::{IdentityProvider, ProviderError, ProviderTokens};
use tiergate::{AppState, Stores};
use url::Url;

/// Check if a Redis server is available via environment variable.
#[allow(dead_code)]
pub fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty())
}

/// Skip test with message if Redis is not available.
#[macro_export]
macro_rules! require_redis {
    () => {
        match crate::common::redis_url() {
            Some(url) => url,
            None => {
                eprintln!("⚠️  Skipping: REDIS_URL not set");
                return;
            }
        }
    };
}

/// Identity provider double. The authorization code names the account:
/// `code-alice` signs in subject `alice`. `bad-code` fails the exchange.
pub struct MockProvider;

#[async_trait]
impl IdentityProvider for MockProvider {
    fn authorization_url(&self, state_token: &str, code_challenge: &str) -> Url {
        let mut url = Url::parse("https://accounts.example.com/o/oauth2/v2/auth").unwrap();
        url.query_pairs_mut()
            .append_pair("state", state_token)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }

    async fn exchange_code(
        &self,
        code: &str,
        _code_verifier: &str,
    ) -> Result<ProviderTokens, ProviderError> {
        if code == "bad-code" {
            return Err(ProviderError::Status {
                status: 400,
                body: "invalid_grant".to_string(),
            });
        }
        Ok(ProviderTokens {
            access_token: format!("provider-token:{code}"),
            id_token: None,
            expires_in: Some(3600),
            refresh_token: None,
        })
    }

    async fn fetch_profile(&self, tokens: &ProviderTokens) -> Result<ProviderProfile, ProviderError> {
        let code = tokens
            .access_token
            .strip_prefix("provider-token:")
            .unwrap_or("unknown");
        let subject = code.strip_prefix("code-").unwrap_or(code);
        Ok(ProviderProfile {
            subject: subject.to_string(),
            email: format!("{subject}@example.com"),
            email_verified: Some(true),
            name: Some(subject.to_string()),
            picture: None,
        })
    }
}

/// Rate limit store that is always down.
#[allow(dead_code)]
pub struct BrokenStore;

#[async_trait]
impl RateLimitStore for BrokenStore {
    async fn increment(
        &self,
        key: &str,
        _window: std::time::Duration,
    ) -> Result<WindowCount, StoreError> {
        Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "connection refused".to_string(),
        })
    }

    async fn decrement(
        &self,
        _key: &str,
        _counted_resets_in: std::time::Duration,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn reset(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Memory-backed stores, returning the store itself for direct access.
#[allow(dead_code)]
pub fn memory_stores(config: &Config) -> (Stores, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(config.oauth_state_ttl));
    let stores = Stores {
        rate_limits: store.clone(),
        oauth_states: store.clone(),
        users: store.clone(),
        refresh_tokens: store.clone(),
    };
    (stores, store)
}

/// Create a test app over the given config and stores.
#[allow(dead_code)]
pub fn create_test_app_with(config: Config, stores: Stores) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(config, stores, Arc::new(MockProvider)).unwrap());
    (create_router(state.clone()), state)
}

#[allow(dead_code)]
pub fn create_test_app_with_config(config: Config) -> (axum::Router, Arc<AppState>) {
    let (stores, _) = memory_stores(&config);
    create_test_app_with(config, stores)
}

/// Create a test app with in-memory storage and the mock provider.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>) {
    create_test_app_with_config(Config::test_default())
}

/// Sign `subject` in directly, bypassing the OAuth flow.
#[allow(dead_code)]
pub async fn sign_in(state: &AppState, subject: &str, tier: PlanTier) -> (User, TokenPair) {
    let profile = ProviderProfile {
        subject: subject.to_string(),
        email: format!("{subject}@example.com"),
        email_verified: Some(true),
        name: None,
        picture: None,
    };
    let mut user = state.stores.users.upsert_from_profile(&profile).await.unwrap();
    if tier != user.tier {
        user = state
            .stores
            .users
            .set_tier(user.id, tier)
            .await
            .unwrap()
            .unwrap();
    }
    let tokens = state.sessions.issue(&user).await.unwrap();
    (user, tokens)
}

#[allow(dead_code)]
pub fn get_with_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[allow(dead_code)]
pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[allow(dead_code)]
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[allow(dead_code)]
pub fn set_cookie_headers(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect()
}

#[allow(dead_code)]
pub fn find_cookie(headers: &[String], name: &str) -> String {
    headers
        .iter()
        .find(|value| value.starts_with(&format!("{name}=")))
        .cloned()
        .unwrap_or_else(|| panic!("missing Set-Cookie header for {name}: {headers:?}"))
}

/// `name=value` part of a Set-Cookie header.
#[allow(dead_code)]
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

#[allow(dead_code)]
pub fn location(response: &Response) -> Url {
    let value = response.headers()[header::LOCATION].to_str().unwrap();
    Url::parse(value).unwrap()
}

#[allow(dead_code)]
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
