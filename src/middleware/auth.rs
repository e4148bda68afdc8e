// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Authentication middleware.

use crate::db::with_timeout;
use crate::error::AppError;
use crate::services::firebase_auth::{
    extract_bearer_token, now_unix_secs, AuthError, IdTokenClaims, SESSION_ISSUER,
};
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::sync::Arc;

/// Cookie set by the frontend holding the Firebase ID token.
pub const SESSION_COOKIE: &str = "__session";

const SESSION_TOKEN_TTL_SECS: usize = 60 * 60;

/// Authenticated user extracted from a verified token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Rejected(reason) => {
                tracing::debug!(reason = %reason, "Rejected auth token");
                AppError::InvalidToken
            }
            AuthError::Transient(reason) => AppError::UpstreamUnavailable(reason),
        }
    }
}

/// Token from the session cookie, else from `Authorization: Bearer`.
pub fn request_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let value = cookie.value().trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string)
}

/// Verify a token and turn it into an [`AuthUser`].
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, AppError> {
    let identity = state.token_verifier.verify(token).await?;
    Ok(AuthUser {
        uid: identity.uid,
        email: identity.email,
    })
}

/// Middleware that requires a valid identity token.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request_token(&jar, request.headers()).ok_or(AppError::Unauthorized)?;
    let auth_user = authenticate(&state, &token).await?;
    request.extensions_mut().insert(auth_user);

    Ok(next.run(request).await)
}

/// Whether the user document carries the ADMIN role.
pub async fn is_admin(state: &AppState, uid: &str) -> Result<bool, AppError> {
    let user = with_timeout(state.config.store_timeout, state.store.get_user(uid)).await?;
    Ok(user.is_some_and(|u| u.role.is_admin()))
}

/// Middleware for admin routes. Must run after [`require_auth`].
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_user = request
        .extensions()
        .get::<AuthUser>()
        .cloned()
        .ok_or(AppError::Unauthorized)?;

    if !is_admin(&state, &auth_user.uid).await? {
        tracing::warn!(uid = %auth_user.uid, "Blocked non-admin request to admin route");
        return Err(AppError::Forbidden("admin role required".to_string()));
    }

    Ok(next.run(request).await)
}

/// Mint an HS256 session token accepted when `AUTH_SHARED_SECRET` is set.
pub fn create_session_token(
    uid: &str,
    email: Option<&str>,
    audience: &str,
    secret: &[u8],
) -> anyhow::Result<String> {
    let now = now_unix_secs() as usize;

    let claims = IdTokenClaims {
        iss: SESSION_ISSUER.to_string(),
        aud: audience.to_string(),
        sub: uid.to_string(),
        exp: now + SESSION_TOKEN_TTL_SECS,
        iat: Some(now),
        email: email.map(str::to_string),
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )?)
}
