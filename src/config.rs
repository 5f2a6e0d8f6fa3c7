// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Read once at startup. A `.env` file is honored for local development.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::models::{PlanTier, TierLimitTable};

/// Minimum length of `SESSION_SECRET` in bytes.
pub const MIN_SESSION_SECRET_LEN: usize = 32;

/// Deployment environment. Development exposes internal error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Where OAuth state, counters, users and refresh tokens live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    /// Process-local. Only correct for a single instance.
    Memory,
    /// Shared by every instance.
    Redis,
}

/// What to do when the rate-limit store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitFailurePolicy {
    /// Log and admit the request.
    FailOpen,
    /// Refuse the request with 503.
    FailClosed,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    pub environment: Environment,
    /// Default post-login redirect and CORS origin
    pub frontend_url: Url,
    /// Extra origins accepted as `redirect_to`
    pub allowed_redirect_origins: Vec<Url>,

    pub google_client_id: String,
    pub google_client_secret: String,
    /// Redirect URI registered with Google
    pub google_callback_url: Url,

    /// Master secret; JWT and refresh-token keys are derived from it
    pub session_secret: Vec<u8>,

    pub state_backend: StateBackend,
    pub redis_url: String,
    pub rate_limit_failure_policy: RateLimitFailurePolicy,
    /// Reverse proxies in front of the service that append to
    /// `X-Forwarded-For`. 0 trusts only the TCP peer.
    pub trusted_proxy_hops: usize,

    pub oauth_state_ttl: Duration,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,

    pub tier_limits: TierLimitTable,

    /// Enables the admin tier endpoint when set
    pub admin_api_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let session_secret = required("SESSION_SECRET")?.into_bytes();
        if session_secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "SESSION_SECRET",
                reason: format!("must be at least {MIN_SESSION_SECRET_LEN} bytes"),
            });
        }

        let mut tier_limits = TierLimitTable::default();
        for (name, tier) in [
            ("RATE_LIMIT_FREE_MAX", PlanTier::Free),
            ("RATE_LIMIT_PRO_MAX", PlanTier::Pro),
            ("RATE_LIMIT_PREMIUM_MAX", PlanTier::Premium),
        ] {
            if let Some(max) = optional_parsed::<u64>(name)? {
                tier_limits = tier_limits.with_max(tier, max);
            }
        }

        Ok(Self {
            port: optional_parsed("PORT")?.unwrap_or(8080),
            environment: match optional("APP_ENV").as_deref() {
                Some("development") | Some("dev") => Environment::Development,
                Some("production") | Some("prod") | None => Environment::Production,
                Some(other) => return Err(invalid("APP_ENV", other)),
            },
            frontend_url: parse_url(
                "FRONTEND_URL",
                &optional("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".to_string()),
            )?,
            allowed_redirect_origins: optional("ALLOWED_REDIRECT_ORIGINS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| parse_url("ALLOWED_REDIRECT_ORIGINS", s))
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?
                .unwrap_or_default(),

            google_client_id: required("GOOGLE_CLIENT_ID")?,
            google_client_secret: required("GOOGLE_CLIENT_SECRET")?,
            google_callback_url: parse_url(
                "GOOGLE_CALLBACK_URL",
                &required("GOOGLE_CALLBACK_URL")?,
            )?,

            session_secret,

            state_backend: match optional("STATE_BACKEND").as_deref() {
                Some("memory") | None => StateBackend::Memory,
                Some("redis") => StateBackend::Redis,
                Some(other) => return Err(invalid("STATE_BACKEND", other)),
            },
            redis_url: optional("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            rate_limit_failure_policy: match optional("RATE_LIMIT_FAILURE_POLICY").as_deref() {
                Some("open") | None => RateLimitFailurePolicy::FailOpen,
                Some("closed") => RateLimitFailurePolicy::FailClosed,
                Some(other) => return Err(invalid("RATE_LIMIT_FAILURE_POLICY", other)),
            },
            trusted_proxy_hops: optional_parsed("TRUSTED_PROXY_HOPS")?.unwrap_or(1),

            oauth_state_ttl: secs("OAUTH_STATE_TTL_SECS", 600)?,
            access_token_ttl: secs("ACCESS_TOKEN_TTL_SECS", 900)?,
            refresh_token_ttl: secs("REFRESH_TOKEN_TTL_SECS", 30 * 24 * 60 * 60)?,

            tier_limits,

            admin_api_token: optional("ADMIN_API_TOKEN"),
        })
    }

    /// Config for tests: in-memory backends, development environment.
    pub fn test_default() -> Self {
        Self {
            port: 8080,
            environment: Environment::Development,
            frontend_url: Url::parse("http://localhost:5173").expect("static URL"),
            allowed_redirect_origins: Vec::new(),
            google_client_id: "test-client-id".to_string(),
            google_client_secret: "test-client-secret".to_string(),
            google_callback_url: Url::parse("http://localhost:8080/auth/google/callback")
                .expect("static URL"),
            session_secret: b"test_session_secret_at_least_32_bytes!".to_vec(),
            state_backend: StateBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            rate_limit_failure_policy: RateLimitFailurePolicy::FailOpen,
            trusted_proxy_hops: 1,
            oauth_state_ttl: Duration::from_secs(600),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            tier_limits: TierLimitTable::default(),
            admin_api_token: Some("test-admin-token".to_string()),
        }
    }

    /// Origins a post-login `redirect_to` may point at.
    pub fn redirect_origins(&self) -> impl Iterator<Item = url::Origin> + '_ {
        std::iter::once(&self.frontend_url)
            .chain(self.allowed_redirect_origins.iter())
            .map(Url::origin)
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: format!("unrecognized value {value:?}"),
    }
}

fn optional_parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional(name)
        .map(|v| {
            v.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        optional_parsed(name)?.unwrap_or(default),
    ))
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide; serialize the tests that set them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "GOOGLE_CLIENT_ID",
        "GOOGLE_CLIENT_SECRET",
        "GOOGLE_CALLBACK_URL",
        "SESSION_SECRET",
        "STATE_BACKEND",
        "RATE_LIMIT_PRO_MAX",
        "ALLOWED_REDIRECT_ORIGINS",
        "APP_ENV",
        "TRUSTED_PROXY_HOPS",
    ];

    fn set_required() {
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("GOOGLE_CLIENT_ID", "test_id");
        env::set_var("GOOGLE_CLIENT_SECRET", "test_secret");
        env::set_var(
            "GOOGLE_CALLBACK_URL",
            "http://localhost:8080/auth/google/callback",
        );
        env::set_var("SESSION_SECRET", "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_config_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::set_var("RATE_LIMIT_PRO_MAX", "5");
        env::set_var(
            "ALLOWED_REDIRECT_ORIGINS",
            "https://app.example.com, https://admin.example.com",
        );

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.google_client_id, "test_id");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.state_backend, StateBackend::Memory);
        assert_eq!(
            config.rate_limit_failure_policy,
            RateLimitFailurePolicy::FailOpen
        );
        assert_eq!(config.tier_limits.get(PlanTier::Pro).max, 5);
        assert_eq!(config.tier_limits.get(PlanTier::Free).max, 100);
        assert_eq!(config.allowed_redirect_origins.len(), 2);
        assert_eq!(config.redirect_origins().count(), 3);
        assert_eq!(config.oauth_state_ttl, Duration::from_secs(600));
        assert_eq!(config.trusted_proxy_hops, 1);
    }

    #[test]
    fn test_trusted_proxy_hops() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::set_var("TRUSTED_PROXY_HOPS", "0");
        assert_eq!(Config::from_env().unwrap().trusted_proxy_hops, 0);

        env::set_var("TRUSTED_PROXY_HOPS", "-1");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "TRUSTED_PROXY_HOPS",
                ..
            })
        ));
    }

    #[test]
    fn test_short_session_secret_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::set_var("SESSION_SECRET", "too-short");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "SESSION_SECRET",
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::set_var("STATE_BACKEND", "postgres");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "STATE_BACKEND",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_client_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::remove_var("GOOGLE_CLIENT_ID");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("GOOGLE_CLIENT_ID"))
        ));
    }
}
