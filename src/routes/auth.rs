// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google sign-in and session routes.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

use crate::error::{AppError, Result};
use crate::middleware::auth::{ACCESS_COOKIE, REFRESH_COOKIE};
use crate::models::TokenPair;
use crate::response::ApiResponse;
use crate::routes::api::UserView;
use crate::services::LoginResult;
use crate::AppState;

/// PKCE verifier cookie, readable only by the callback.
pub const VERIFIER_COOKIE: &str = "tiergate_pkce";
const CALLBACK_PATH: &str = "/auth/google/callback";
const REFRESH_COOKIE_PATH: &str = "/auth";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/google", get(auth_start))
        .route(CALLBACK_PATH, get(auth_callback).post(auth_callback_json))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

/// TCP peer, present when served with connect info.
type Peer = Option<Extension<ConnectInfo<SocketAddr>>>;

/// Client address for throttling.
///
/// Each of the `trusted_hops` proxies in front of the service appends the
/// address it received from to `X-Forwarded-For`, so the client is the entry
/// the outermost trusted proxy wrote. Entries left of it are client-supplied
/// and ignored. Without trusted proxies or the header, the TCP peer is used.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_hops: usize) -> String {
    let forwarded: Vec<&str> = if trusted_hops == 0 {
        Vec::new()
    } else {
        headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect()
    };

    forwarded
        .iter()
        .rev()
        .nth(trusted_hops.saturating_sub(1))
        .or(forwarded.first())
        .map(|hop| hop.to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn callback_client(state: &AppState, headers: &HeaderMap, peer: Peer) -> String {
    client_address(
        headers,
        peer.map(|Extension(ConnectInfo(addr))| addr),
        state.config.trusted_proxy_hops,
    )
}

fn secure_cookies(state: &AppState) -> bool {
    state.config.frontend_url.scheme() == "https"
}

fn cookie_max_age(ttl: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

fn session_cookies(state: &AppState, jar: CookieJar, tokens: &TokenPair) -> CookieJar {
    let secure = secure_cookies(state);
    jar.add(
        Cookie::build((ACCESS_COOKIE, tokens.access_token.clone()))
            .path("/")
            .http_only(true)
            .secure(secure)
            .same_site(SameSite::Lax)
            .max_age(cookie_max_age(state.sessions.access_token_ttl())),
    )
    .add(
        Cookie::build((REFRESH_COOKIE, tokens.refresh_token.clone()))
            .path(REFRESH_COOKIE_PATH)
            .http_only(true)
            .secure(secure)
            .same_site(SameSite::Lax)
            .max_age(cookie_max_age(state.sessions.refresh_token_ttl())),
    )
}

fn clear_session_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(ACCESS_COOKIE).path("/"))
        .remove(Cookie::build(REFRESH_COOKIE).path(REFRESH_COOKIE_PATH))
}

#[derive(Deserialize)]
pub struct AuthStartParams {
    /// Where to land after login. Defaults to FRONTEND_URL.
    #[serde(default)]
    redirect_to: Option<String>,
}

/// Start OAuth flow - redirect to Google.
async fn auth_start(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<AuthStartParams>,
) -> Result<(CookieJar, Redirect)> {
    let request = state.oauth.begin(params.redirect_to.as_deref()).await?;

    let jar = jar.add(
        Cookie::build((VERIFIER_COOKIE, request.code_verifier))
            .path(CALLBACK_PATH)
            .http_only(true)
            .secure(secure_cookies(&state))
            // Lax: the cookie must ride along on Google's top-level redirect back.
            .same_site(SameSite::Lax)
            .max_age(cookie_max_age(state.config.oauth_state_ttl)),
    );

    Ok((jar, Redirect::temporary(request.authorization_url.as_str())))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    error: Option<String>,
}

/// Browser callback. Every outcome is a redirect; failures land on the
/// frontend login page with a generic error.
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    let client = callback_client(&state, &headers, peer);
    let verifier = jar
        .get(VERIFIER_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();
    let jar = jar.remove(Cookie::build(VERIFIER_COOKIE).path(CALLBACK_PATH));

    let outcome = match params.error {
        Some(error) => Err(state.oauth.abandon(&params.state, &error).await),
        None => complete_login(&state, &client, &params.code, &params.state, &verifier).await,
    };

    match outcome {
        Ok(login) => {
            let jar = session_cookies(&state, jar, &login.tokens);
            (jar, Redirect::temporary(login.redirect_to.as_str())).into_response()
        }
        Err(err) => {
            tracing::warn!(
                code = err.code(),
                error = %err,
                "OAuth callback failed, redirecting to login"
            );

            let mut target = state.config.frontend_url.clone();
            target.set_path("/login");
            target.set_query(Some("error=authentication_failed"));
            (jar, Redirect::temporary(target.as_str())).into_response()
        }
    }
}

async fn complete_login(
    state: &AppState,
    client: &str,
    code: &str,
    state_token: &str,
    verifier: &str,
) -> Result<LoginResult> {
    state.login_throttle.check(client).await?;
    let login = state.oauth.complete(code, state_token, verifier).await?;
    state.login_throttle.reset(client).await;
    Ok(login)
}

/// Callback body for clients that keep the verifier themselves.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CallbackRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 4096))]
    pub code: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub state: String,
    #[serde(default)]
    #[validate(length(min = 43, max = 128))]
    pub code_verifier: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct LoginResponse {
    pub user: UserView,
    pub tokens: TokenPair,
    pub redirect_to: String,
}

fn validation_error(err: validator::ValidationErrors) -> AppError {
    let mut fields: Vec<String> = err.field_errors().keys().map(|k| k.to_string()).collect();
    fields.sort();
    AppError::Validation(format!("invalid fields: {}", fields.join(", ")))
}

async fn auth_callback_json(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    body: std::result::Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<ApiResponse<LoginResponse>> {
    let Json(body) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    body.validate().map_err(validation_error)?;

    let client = callback_client(&state, &headers, peer);
    let login = complete_login(&state, &client, &body.code, &body.state, &body.code_verifier)
        .await?;

    Ok(ApiResponse::ok(LoginResponse {
        user: UserView::from(&login.user),
        tokens: login.tokens,
        redirect_to: login.redirect_to.to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Refresh token from a JSON body, else from the cookie.
fn presented_refresh_token(jar: &CookieJar, body: &Bytes) -> Result<Option<(String, bool)>> {
    if !body.is_empty() {
        let request: RefreshRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("invalid JSON body: {e}")))?;
        if let Some(token) = request.refresh_token.filter(|t| !t.is_empty()) {
            return Ok(Some((token, false)));
        }
    }
    Ok(jar
        .get(REFRESH_COOKIE)
        .map(|c| (c.value().to_string(), true)))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, ApiResponse<TokenPair>)> {
    let (token, from_cookie) =
        presented_refresh_token(&jar, &body)?.ok_or(AppError::Unauthorized)?;

    let (user, tokens) = state.sessions.refresh(&token).await?;
    tracing::debug!(user_id = %user.id, "Session refreshed");

    let jar = if from_cookie {
        session_cookies(&state, jar, &tokens)
    } else {
        jar
    };
    Ok((jar, ApiResponse::ok(tokens)))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, StatusCode)> {
    if let Some((token, _)) = presented_refresh_token(&jar, &body)? {
        state.sessions.revoke(&token).await?;
    }
    Ok((clear_session_cookies(jar), StatusCode::NO_CONTENT))
}
