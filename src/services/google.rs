// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google OAuth 2.0 client: authorization URL, code exchange (with PKCE) and
//! userinfo lookup.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::models::ProviderProfile;

const AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const SCOPES: &str = "openid email profile";

/// Identity provider errors. All of them surface to clients as 502.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Tokens returned by the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The external identity provider, behind a seam so tests can script it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser to start a login.
    fn authorization_url(&self, state_token: &str, code_challenge: &str) -> Url;

    /// Trade an authorization code and its PKCE verifier for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ProviderTokens, ProviderError>;

    async fn fetch_profile(&self, tokens: &ProviderTokens)
        -> Result<ProviderProfile, ProviderError>;
}

/// Endpoint set, overridable for tests against a local server.
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub authorization: Url,
    pub token: Url,
    pub userinfo: Url,
}

impl GoogleEndpoints {
    pub fn google() -> Result<Self, url::ParseError> {
        Ok(Self {
            authorization: Url::parse(AUTHORIZATION_ENDPOINT)?,
            token: Url::parse(TOKEN_ENDPOINT)?,
            userinfo: Url::parse(USERINFO_ENDPOINT)?,
        })
    }
}

/// Google OAuth client.
#[derive(Clone)]
pub struct GoogleProvider {
    http: reqwest::Client,
    endpoints: GoogleEndpoints,
    client_id: String,
    client_secret: String,
    callback_url: Url,
}

impl GoogleProvider {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_endpoints(config, GoogleEndpoints::google()?)
    }

    pub fn with_endpoints(config: &Config, endpoints: GoogleEndpoints) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            endpoints,
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            callback_url: config.google_callback_url.clone(),
        })
    }

    /// Check response status and parse the JSON body.
    async fn check_response_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_url(&self, state_token: &str, code_challenge: &str) -> Url {
        let mut url = self.endpoints.authorization.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.callback_url.as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPES)
            .append_pair("state", state_token)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "online")
            .append_pair("prompt", "select_account");
        url
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ProviderTokens, ProviderError> {
        let response = self
            .http
            .post(self.endpoints.token.clone())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("code_verifier", code_verifier),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.callback_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("token exchange: {e}")))?;

        Self::check_response_json(response).await
    }

    async fn fetch_profile(
        &self,
        tokens: &ProviderTokens,
    ) -> Result<ProviderProfile, ProviderError> {
        let response = self
            .http
            .get(self.endpoints.userinfo.clone())
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("userinfo: {e}")))?;

        let profile: ProviderProfile = Self::check_response_json(response).await?;

        if profile.email_verified == Some(false) {
            return Err(ProviderError::Decode(format!(
                "email {} is not verified",
                profile.email
            )));
        }

        Ok(profile)
    }
}
