// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (authentication, admission, security, etc.).

pub mod admin_auth;
pub mod admission;
pub mod auth;
pub mod etag;
pub mod security;

pub use admin_auth::require_admin_token;
pub use admission::admit;
pub use auth::{require_auth, AuthUser};
