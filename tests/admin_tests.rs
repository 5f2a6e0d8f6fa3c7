// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Operator routes: plan changes and session revocation.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use serde_json::json;
use tiergate::config::Config;
use tiergate::models::PlanTier;
use tower::ServiceExt;
use uuid::Uuid;

mod common;

use common::{body_json, get_with_bearer, post_json, sign_in};

fn set_tier_request(user_id: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("PUT")
        .uri(format!("/admin/users/{user_id}/tier"))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_admin_token_required() {
    let (app, state) = common::create_test_app();
    let (user, _) = sign_in(&state, "plain", PlanTier::Free).await;
    let id = user.id.to_string();

    let response = app
        .clone()
        .oneshot(set_tier_request(&id, None, json!({"tier": "PRO"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(set_tier_request(&id, Some("wrong-token"), json!({"tier": "PRO"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let stored = state.stores.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.tier, PlanTier::Free);
}

#[tokio::test]
async fn test_admin_routes_absent_without_token() {
    let mut config = Config::test_default();
    config.admin_api_token = None;
    let (app, state) = common::create_test_app_with_config(config);
    let (user, _) = sign_in(&state, "plain", PlanTier::Free).await;

    let response = app
        .oneshot(set_tier_request(
            &user.id.to_string(),
            Some("test-admin-token"),
            json!({"tier": "PRO"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upgrade_unlocks_features() {
    let (app, state) = common::create_test_app();
    let (user, tokens) = sign_in(&state, "buyer", PlanTier::Free).await;

    let response = app
        .clone()
        .oneshot(get_with_bearer("/api/features/analytics", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "feature_not_available");
    assert_eq!(json["error"]["meta"]["current_tier"], "FREE");

    let response = app
        .clone()
        .oneshot(set_tier_request(
            &user.id.to_string(),
            Some("test-admin-token"),
            json!({"tier": "PRO"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["tier"], "PRO");
    assert!(json["data"]["features"]
        .as_array()
        .unwrap()
        .contains(&json!("analytics")));

    let stored = state.stores.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.tier, PlanTier::Pro);
    assert!(stored.tier_changed_at.is_some());

    // Same access token, new tier.
    let response = app
        .oneshot(get_with_bearer("/api/features/analytics", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_login_does_not_reset_tier() {
    let (_, state) = common::create_test_app();
    let (user, _) = sign_in(&state, "loyal", PlanTier::Premium).await;

    let profile = tiergate::models::ProviderProfile {
        subject: "loyal".to_string(),
        email: "loyal@example.org".to_string(),
        email_verified: Some(true),
        name: Some("Renamed".to_string()),
        picture: None,
    };
    let again = state.stores.users.upsert_from_profile(&profile).await.unwrap();
    assert_eq!(again.id, user.id);
    assert_eq!(again.email, "loyal@example.org");
    assert_eq!(again.tier, PlanTier::Premium);
}

#[tokio::test]
async fn test_set_tier_errors() {
    let (app, _) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(set_tier_request(
            &Uuid::new_v4().to_string(),
            Some("test-admin-token"),
            json!({"tier": "PRO"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(set_tier_request(
            "not-a-uuid",
            Some("test-admin-token"),
            json!({"tier": "PRO"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(set_tier_request(
            &Uuid::new_v4().to_string(),
            Some("test-admin-token"),
            json!({"tier": "GOLD"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_revoke_all_sessions() {
    let (app, state) = common::create_test_app();
    let (user, first) = sign_in(&state, "breached", PlanTier::Free).await;
    let (_, second) = sign_in(&state, "breached", PlanTier::Free).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/users/{}/sessions/revoke", user.id))
                .header(header::AUTHORIZATION, "Bearer test-admin-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["revoked"], 2);

    for tokens in [&first, &second] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/refresh",
                json!({"refresh_token": tokens.refresh_token}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // Access tokens are not revocable; they run out on their own.
    let response = app
        .oneshot(get_with_bearer("/api/me", &first.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
