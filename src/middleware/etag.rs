// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Weak ETags for GET JSON responses, with `If-None-Match` -> 304.

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Hex digits of the body hash kept in the tag.
const TAG_HEX_LEN: usize = 32;

/// `W/"<hash prefix>"` for a response body.
pub fn weak_etag(body: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(body));
    format!("W/\"{}\"", &digest[..TAG_HEX_LEN])
}

/// Weak comparison of an `If-None-Match` value against a tag.
fn matches_if_none_match(if_none_match: &str, tag: &str) -> bool {
    let opaque = |t: &str| t.trim().trim_start_matches("W/").to_string();
    let ours = opaque(tag);
    if_none_match
        .split(',')
        .any(|candidate| candidate.trim() == "*" || opaque(candidate) == ours)
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

pub async fn etag(req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }
    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = next.run(req).await;
    if response.status() != StatusCode::OK || !is_json(&response) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AppError::Internal(anyhow::anyhow!("failed to buffer response: {}", e))
                .into_response();
        }
    };

    let tag = weak_etag(&bytes);
    let tag_value = match HeaderValue::from_str(&tag) {
        Ok(value) => value,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };
    parts.headers.insert(header::ETAG, tag_value);
    parts
        .headers
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-cache"));

    if if_none_match.is_some_and(|inm| matches_if_none_match(&inm, &tag)) {
        parts.status = StatusCode::NOT_MODIFIED;
        parts.headers.remove(header::CONTENT_TYPE);
        parts.headers.remove(header::CONTENT_LENGTH);
        return Response::from_parts(parts, Body::empty());
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use tower::ServiceExt; // for oneshot

    fn app() -> Router {
        Router::new()
            .route(
                "/data",
                get(|| async { Json(serde_json::json!({"n": 1})) })
                    .post(|| async { Json(serde_json::json!({"n": 2})) }),
            )
            .route("/text", get(|| async { "plain" }))
            .layer(axum::middleware::from_fn(etag))
    }

    #[test]
    fn test_weak_comparison() {
        let tag = weak_etag(b"{}");
        assert!(tag.starts_with("W/\""));
        assert!(matches_if_none_match(&tag, &tag));
        assert!(matches_if_none_match(&tag.replace("W/", ""), &tag));
        assert!(matches_if_none_match(&format!("\"other\", {tag}"), &tag));
        assert!(matches_if_none_match("*", &tag));
        assert!(!matches_if_none_match("W/\"other\"", &tag));
    }

    #[tokio::test]
    async fn test_get_json_gets_etag_and_304() {
        let first = app()
            .oneshot(Request::builder().uri("/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let tag = first.headers()[header::ETAG].to_str().unwrap().to_string();

        let second = app()
            .oneshot(
                Request::builder()
                    .uri("/data")
                    .header(header::IF_NONE_MATCH, &tag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(second.headers()[header::ETAG], tag.as_str());
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_non_json_and_non_get_untouched() {
        let text = app()
            .oneshot(Request::builder().uri("/text").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(text.headers().get(header::ETAG).is_none());

        let post = app()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/data")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(post.headers().get(header::ETAG).is_none());
    }
}
