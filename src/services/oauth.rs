// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google login flow: authorization-code grant with PKCE.
//!
//! `begin` stores a single-use state bound to a PKCE verifier. `complete`
//! consumes that state *before* anything else can fail, so a leaked
//! `code` + `state` pair cannot be replayed even when the exchange errors.

use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::{Config, RateLimitFailurePolicy};
use crate::db::{keys, OAuthStateRepository, RateLimitStore, UserRepository};
use crate::error::{AppError, AuthFailure, Result};
use crate::models::{ConsumeOutcome, TokenPair, User};
use crate::services::google::IdentityProvider;
use crate::services::pkce::{compute_code_challenge, generate_code_verifier, verify_code_challenge};
use crate::services::session::SessionService;

/// Callback attempts allowed per client address per window.
pub const LOGIN_ATTEMPT_MAX: u64 = 20;
pub const LOGIN_ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// A started login, ready to send the browser to the provider.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: Url,
    /// Bound to the browser (HttpOnly cookie) for the GET callback
    pub code_verifier: String,
    pub state_token: String,
}

/// A completed login.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: User,
    pub tokens: TokenPair,
    pub redirect_to: Url,
}

pub struct OAuthService {
    states: Arc<dyn OAuthStateRepository>,
    provider: Arc<dyn IdentityProvider>,
    users: Arc<dyn UserRepository>,
    sessions: Arc<SessionService>,
    default_redirect: Url,
    allowed_origins: Vec<url::Origin>,
}

impl OAuthService {
    pub fn new(
        config: &Config,
        states: Arc<dyn OAuthStateRepository>,
        provider: Arc<dyn IdentityProvider>,
        users: Arc<dyn UserRepository>,
        sessions: Arc<SessionService>,
    ) -> Self {
        Self {
            states,
            provider,
            users,
            sessions,
            default_redirect: config.frontend_url.clone(),
            allowed_origins: config.redirect_origins().collect(),
        }
    }

    /// Resolve a client-supplied post-login target. Absent means the
    /// frontend; a path is taken relative to the frontend; anything absolute
    /// must be http(s) on an allowed origin.
    pub fn validate_redirect(&self, redirect_to: Option<&str>) -> Result<Url> {
        let raw = match redirect_to.map(str::trim) {
            None | Some("") => return Ok(self.default_redirect.clone()),
            Some(raw) => raw,
        };

        let parsed = if raw.starts_with('/') && !raw.starts_with("//") {
            self.default_redirect.join(raw)
        } else {
            Url::parse(raw)
        };
        let url = parsed
            .map_err(|_| AppError::Validation("redirect_to is not a valid URL".to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Validation(
                "redirect_to must be an http(s) URL".to_string(),
            ));
        }
        if !self.allowed_origins.contains(&url.origin()) {
            tracing::warn!(redirect_to = %url, "Rejected redirect_to outside allowed origins");
            return Err(AppError::Validation(
                "redirect_to is not an allowed origin".to_string(),
            ));
        }

        Ok(url)
    }

    /// Start a login: store state and verifier, build the provider URL.
    pub async fn begin(&self, redirect_to: Option<&str>) -> Result<AuthorizationRequest> {
        let redirect_to = self.validate_redirect(redirect_to)?;
        let code_verifier = generate_code_verifier();
        let code_challenge = compute_code_challenge(&code_verifier);

        let state = self
            .states
            .create_state(redirect_to, code_verifier.clone())
            .await?;

        tracing::info!(
            state_id = %state.id,
            redirect_to = %state.redirect_to,
            "Starting OAuth flow, redirecting to Google"
        );

        Ok(AuthorizationRequest {
            authorization_url: self
                .provider
                .authorization_url(&state.state_token, &code_challenge),
            code_verifier,
            state_token: state.state_token,
        })
    }

    /// Finish a login from the provider callback.
    pub async fn complete(
        &self,
        code: &str,
        state_token: &str,
        code_verifier: &str,
    ) -> Result<LoginResult> {
        if code.is_empty() || state_token.is_empty() || code_verifier.is_empty() {
            return Err(AppError::Validation(
                "code, state and code_verifier are required".to_string(),
            ));
        }

        let state = match self.states.consume_state(state_token).await? {
            ConsumeOutcome::Consumed(state) => state,
            ConsumeOutcome::NotFound => {
                return Err(AppError::AuthenticationFailed(AuthFailure::StateNotFound));
            }
            ConsumeOutcome::Expired(state) => {
                tracing::debug!(state_id = %state.id, expires_at = %state.expires_at, "State expired");
                return Err(AppError::AuthenticationFailed(AuthFailure::StateExpired));
            }
            ConsumeOutcome::AlreadyUsed(state) => {
                tracing::warn!(state_id = %state.id, "Replay of an already used OAuth state");
                return Err(AppError::AuthenticationFailed(
                    AuthFailure::StateAlreadyUsed,
                ));
            }
        };

        let expected_challenge = compute_code_challenge(&state.code_verifier);
        if !verify_code_challenge(code_verifier, &expected_challenge) {
            return Err(AppError::AuthenticationFailed(AuthFailure::PkceMismatch));
        }

        let tokens = self
            .provider
            .exchange_code(code, code_verifier)
            .await
            .map_err(|e| AppError::UpstreamProvider(e.to_string()))?;
        let profile = self
            .provider
            .fetch_profile(&tokens)
            .await
            .map_err(|e| AppError::UpstreamProvider(e.to_string()))?;

        let user = self.users.upsert_from_profile(&profile).await?;
        let tokens = self.sessions.issue(&user).await?;

        tracing::info!(
            user_id = %user.id,
            tier = %user.tier,
            state_id = %state.id,
            "OAuth login successful"
        );

        Ok(LoginResult {
            user,
            tokens,
            redirect_to: state.redirect_to,
        })
    }

    /// The provider reported an error (user denied consent, ...). Burn the
    /// state so it cannot be retried, then fail.
    pub async fn abandon(&self, state_token: &str, reason: &str) -> AppError {
        if !state_token.is_empty() {
            if let Err(e) = self.states.consume_state(state_token).await {
                tracing::warn!(error = %e, "Failed to burn OAuth state after provider error");
            }
        }
        AppError::AuthenticationFailed(AuthFailure::ProviderDenied(reason.to_string()))
    }
}

/// Brute-force brake on the callback endpoint, keyed by client address.
///
/// Every attempt counts; a successful login resets the counter, so what
/// accumulates is failures.
pub struct LoginThrottle {
    store: Arc<dyn RateLimitStore>,
    policy: RateLimitFailurePolicy,
    max: u64,
    window: Duration,
}

impl LoginThrottle {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: RateLimitFailurePolicy) -> Self {
        Self {
            store,
            policy,
            max: LOGIN_ATTEMPT_MAX,
            window: LOGIN_ATTEMPT_WINDOW,
        }
    }

    pub fn with_limit(mut self, max: u64, window: Duration) -> Self {
        self.max = max;
        self.window = window;
        self
    }

    /// Count an attempt from `client`; deny once over the limit.
    pub async fn check(&self, client: &str) -> Result<()> {
        match self
            .store
            .increment(&keys::login_attempts(client), self.window)
            .await
        {
            Ok(counted) if counted.count > self.max => {
                tracing::warn!(client = %client, count = counted.count, "Login attempts throttled");
                Err(AppError::RateLimitExceeded {
                    limit: self.max,
                    retry_after: counted.resets_in,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => match self.policy {
                RateLimitFailurePolicy::FailOpen => {
                    tracing::warn!(error = %e, "Login throttle unavailable, failing open");
                    Ok(())
                }
                RateLimitFailurePolicy::FailClosed => Err(e.into()),
            },
        }
    }

    /// Clear `client`'s counter after a successful login.
    pub async fn reset(&self, client: &str) {
        if let Err(e) = self.store.reset(&keys::login_attempts(client)).await {
            tracing::warn!(error = %e, "Failed to reset login attempt counter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ProviderProfile;
    use crate::services::google::{ProviderError, ProviderTokens};
    use async_trait::async_trait;

    struct StaticProvider;

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        fn authorization_url(&self, state_token: &str, code_challenge: &str) -> Url {
            let mut url = Url::parse("https://idp.example.com/auth").unwrap();
            url.query_pairs_mut()
                .append_pair("state", state_token)
                .append_pair("code_challenge", code_challenge);
            url
        }

        async fn exchange_code(
            &self,
            code: &str,
            _code_verifier: &str,
        ) -> std::result::Result<ProviderTokens, ProviderError> {
            if code == "bad-code" {
                return Err(ProviderError::Status {
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(ProviderTokens {
                access_token: "provider-token".to_string(),
                id_token: None,
                expires_in: Some(3600),
                refresh_token: None,
            })
        }

        async fn fetch_profile(
            &self,
            _tokens: &ProviderTokens,
        ) -> std::result::Result<ProviderProfile, ProviderError> {
            Ok(ProviderProfile {
                subject: "g-42".to_string(),
                email: "grace@example.com".to_string(),
                email_verified: Some(true),
                name: Some("Grace".to_string()),
                picture: None,
            })
        }
    }

    fn service() -> (OAuthService, Arc<MemoryStore>) {
        let mut config = Config::test_default();
        config.allowed_redirect_origins = vec![Url::parse("https://app.example.com").unwrap()];
        let store = Arc::new(MemoryStore::new(config.oauth_state_ttl));
        let sessions =
            Arc::new(SessionService::new(&config, store.clone(), store.clone()).unwrap());
        let service = OAuthService::new(
            &config,
            store.clone(),
            Arc::new(StaticProvider),
            store.clone(),
            sessions,
        );
        (service, store)
    }

    #[test]
    fn test_validate_redirect() {
        let (service, _) = service();

        assert_eq!(
            service.validate_redirect(None).unwrap().as_str(),
            "http://localhost:5173/"
        );
        assert_eq!(
            service.validate_redirect(Some("/courses/1")).unwrap().as_str(),
            "http://localhost:5173/courses/1"
        );
        assert_eq!(
            service
                .validate_redirect(Some("https://app.example.com/x"))
                .unwrap()
                .as_str(),
            "https://app.example.com/x"
        );

        for bad in [
            "https://evil.example.com/",
            "//evil.example.com/x",
            "javascript:alert(1)",
            "http://app.example.com/x",
            "not a url",
        ] {
            assert!(
                matches!(service.validate_redirect(Some(bad)), Err(AppError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_begin_then_complete() {
        let (service, store) = service();
        let request = service.begin(Some("https://app.example.com/x")).await.unwrap();

        let stored = store
            .find_state_by_token(&request.state_token)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_valid());
        assert_eq!(stored.code_verifier, request.code_verifier);

        let params: std::collections::HashMap<_, _> =
            request.authorization_url.query_pairs().into_owned().collect();
        assert_eq!(
            params["code_challenge"],
            compute_code_challenge(&request.code_verifier)
        );

        let login = service
            .complete("good-code", &request.state_token, &request.code_verifier)
            .await
            .unwrap();
        assert_eq!(login.redirect_to.as_str(), "https://app.example.com/x");
        assert_eq!(login.user.email, "grace@example.com");
        assert_eq!(login.tokens.token_type, "Bearer");
    }

    #[tokio::test]
    async fn test_empty_inputs_touch_nothing() {
        let (service, store) = service();
        let request = service.begin(None).await.unwrap();

        assert!(matches!(
            service.complete("", &request.state_token, &request.code_verifier).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.complete("code", &request.state_token, "").await,
            Err(AppError::Validation(_))
        ));

        // The state was not consumed by the rejected calls.
        assert!(store
            .find_state_by_token(&request.state_token)
            .await
            .unwrap()
            .unwrap()
            .is_valid());
    }

    #[tokio::test]
    async fn test_pkce_mismatch_still_burns_state() {
        let (service, _) = service();
        let request = service.begin(None).await.unwrap();
        let wrong_verifier = generate_code_verifier();

        assert!(matches!(
            service.complete("good-code", &request.state_token, &wrong_verifier).await,
            Err(AppError::AuthenticationFailed(AuthFailure::PkceMismatch))
        ));
        assert!(matches!(
            service
                .complete("good-code", &request.state_token, &request.code_verifier)
                .await,
            Err(AppError::AuthenticationFailed(AuthFailure::StateAlreadyUsed))
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_still_burns_state() {
        let (service, _) = service();
        let request = service.begin(None).await.unwrap();

        assert!(matches!(
            service
                .complete("bad-code", &request.state_token, &request.code_verifier)
                .await,
            Err(AppError::UpstreamProvider(_))
        ));
        assert!(matches!(
            service
                .complete("good-code", &request.state_token, &request.code_verifier)
                .await,
            Err(AppError::AuthenticationFailed(AuthFailure::StateAlreadyUsed))
        ));
    }

    #[tokio::test]
    async fn test_unknown_state() {
        let (service, _) = service();
        assert!(matches!(
            service
                .complete("code", "no-such-state", &generate_code_verifier())
                .await,
            Err(AppError::AuthenticationFailed(AuthFailure::StateNotFound))
        ));
    }

    #[tokio::test]
    async fn test_abandon_burns_state() {
        let (service, _) = service();
        let request = service.begin(None).await.unwrap();

        let err = service.abandon(&request.state_token, "access_denied").await;
        assert!(matches!(
            err,
            AppError::AuthenticationFailed(AuthFailure::ProviderDenied(_))
        ));
        assert!(service
            .complete("good-code", &request.state_token, &request.code_verifier)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_login_throttle() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(600)));
        let throttle = LoginThrottle::new(store, RateLimitFailurePolicy::FailOpen)
            .with_limit(3, Duration::from_secs(60));

        for _ in 0..3 {
            throttle.check("10.0.0.1").await.unwrap();
        }
        assert!(matches!(
            throttle.check("10.0.0.1").await,
            Err(AppError::RateLimitExceeded { limit: 3, .. })
        ));
        throttle.check("10.0.0.2").await.unwrap();

        throttle.reset("10.0.0.1").await;
        throttle.check("10.0.0.1").await.unwrap();
    }
}
