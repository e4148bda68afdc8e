// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firebase ID token verification for learner and admin requests.

use crate::config::Config;
use anyhow::Context;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};

const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const CLOCK_SKEW_SECS: u64 = 60;

/// Issuer used for locally minted session tokens.
pub const SESSION_ISSUER: &str = "course-enrollment";

/// Identity established from a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub uid: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AuthError {
    /// Malformed, expired or foreign token.
    Rejected(String),
    /// Key material could not be fetched; the caller may retry.
    Transient(String),
}

enum VerifierMode {
    Firebase,
    SharedSecret(Arc<DecodingKey>),
}

#[derive(Clone)]
struct JwksCacheEntry {
    keys_by_kid: HashMap<String, Arc<DecodingKey>>,
    expires_at: Instant,
}

/// Claims carried by both Firebase ID tokens and local session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: usize,
    pub iat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

pub struct FirebaseTokenVerifier {
    http_client: reqwest::Client,
    project_id: String,
    mode: VerifierMode,
    jwks_cache: RwLock<Option<JwksCacheEntry>>,
    refresh_lock: Mutex<()>,
}

impl FirebaseTokenVerifier {
    /// Build a verifier. `AUTH_SHARED_SECRET` switches to HS256 session
    /// tokens; otherwise Firebase ID tokens are checked against Google's keys.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .context("failed building token verifier HTTP client")?;

        let mode = match &config.auth_shared_secret {
            Some(secret) => {
                tracing::warn!("Using shared-secret session tokens instead of Firebase ID tokens");
                VerifierMode::SharedSecret(Arc::new(DecodingKey::from_secret(secret)))
            }
            None => {
                tracing::info!(project = %config.gcp_project_id, "Initialized Firebase token verifier");
                VerifierMode::Firebase
            }
        };

        Ok(Self {
            http_client,
            project_id: config.gcp_project_id.clone(),
            mode,
            jwks_cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Rejected("token is empty".to_string()));
        }

        let header = decode_header(token)
            .map_err(|e| AuthError::Rejected(format!("invalid JWT header: {e}")))?;

        let (decoding_key, validation) = match &self.mode {
            VerifierMode::SharedSecret(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(AuthError::Rejected(format!(
                        "unexpected JWT alg: {:?}",
                        header.alg
                    )));
                }
                let validation = self.validation(Algorithm::HS256, SESSION_ISSUER.to_string());
                (key.clone(), validation)
            }
            VerifierMode::Firebase => {
                if header.alg != Algorithm::RS256 {
                    return Err(AuthError::Rejected(format!(
                        "unexpected JWT alg: {:?}",
                        header.alg
                    )));
                }
                let kid = header
                    .kid
                    .ok_or_else(|| AuthError::Rejected("missing JWT kid".to_string()))?;
                let key = self.decoding_key_for_kid(&kid).await?;
                let issuer = format!("https://securetoken.google.com/{}", self.project_id);
                (key, self.validation(Algorithm::RS256, issuer))
            }
        };

        let claims = decode::<IdTokenClaims>(token, decoding_key.as_ref(), &validation)
            .map_err(|e| AuthError::Rejected(format!("JWT validation failed: {e}")))?
            .claims;

        validate_iat(claims.iat)?;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::Rejected("empty sub claim".to_string()));
        }

        Ok(VerifiedIdentity {
            uid: claims.sub,
            email: claims.email,
        })
    }

    fn validation(&self, alg: Algorithm, issuer: String) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[self.project_id.as_str()]);
        validation.leeway = CLOCK_SKEW_SECS;
        validation
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        if let Some(key) = self.lookup_cached_key(kid).await {
            return Ok(key);
        }

        for force_refresh in [false, true] {
            self.refresh_jwks(force_refresh).await?;
            if let Some(key) = self.lookup_cached_key(kid).await {
                return Ok(key);
            }
        }

        Err(AuthError::Rejected(format!(
            "JWT kid not found in JWKS after refresh: {kid}"
        )))
    }

    async fn lookup_cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        let cache = self.jwks_cache.read().await;
        let now = Instant::now();
        cache
            .as_ref()
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| entry.keys_by_kid.get(kid))
            .cloned()
    }

    async fn refresh_jwks(&self, force_refresh: bool) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;

        if !force_refresh {
            let cache = self.jwks_cache.read().await;
            if cache
                .as_ref()
                .is_some_and(|entry| entry.expires_at > Instant::now())
            {
                return Ok(());
            }
        }

        tracing::debug!(jwks_uri = FIREBASE_JWKS_URL, "Refreshing Firebase JWKS cache");

        let response = self
            .http_client
            .get(FIREBASE_JWKS_URL)
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("JWKS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::Transient(format!(
                "JWKS request returned status {}",
                response.status()
            )));
        }

        let ttl = cache_ttl_from_headers(response.headers(), DEFAULT_CACHE_TTL);

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| AuthError::Transient(format!("invalid JWKS JSON: {e}")))?;

        let keys_by_kid: HashMap<String, Arc<DecodingKey>> = jwks
            .keys
            .into_iter()
            .filter(|jwk| jwk.kty == "RSA" && !jwk.kid.trim().is_empty())
            .filter(|jwk| jwk.alg.as_deref().map_or(true, |alg| alg == "RS256"))
            .filter_map(|jwk| match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => Some((jwk.kid, Arc::new(key))),
                Err(e) => {
                    tracing::warn!(error = %e, kid = %jwk.kid, "Skipping invalid RSA JWKS key");
                    None
                }
            })
            .collect();

        if keys_by_kid.is_empty() {
            return Err(AuthError::Transient(
                "JWKS response did not include any usable RSA keys".to_string(),
            ));
        }

        *self.jwks_cache.write().await = Some(JwksCacheEntry {
            keys_by_kid,
            expires_at: Instant::now() + ttl,
        });

        tracing::debug!(ttl_secs = ttl.as_secs(), "Firebase JWKS cache refreshed");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    alg: Option<String>,
    n: String,
    e: String,
}

/// Pull the token out of an `Authorization: Bearer ...` value.
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn validate_iat(iat: Option<usize>) -> Result<(), AuthError> {
    let Some(iat) = iat else {
        return Err(AuthError::Rejected("missing iat claim".to_string()));
    };

    if iat as u64 > now_unix_secs() + CLOCK_SKEW_SECS {
        return Err(AuthError::Rejected("iat claim is in the future".to_string()));
    }

    Ok(())
}

fn cache_ttl_from_headers(headers: &reqwest::header::HeaderMap, fallback: Duration) -> Duration {
    headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_cache_control_max_age)
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn parse_cache_control_max_age(value: &str) -> Option<u64> {
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|raw| raw.trim_matches('"').parse::<u64>().ok())
}

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn shared_secret_verifier() -> FirebaseTokenVerifier {
        let mut config = Config::test_default();
        config.auth_shared_secret = Some(b"unit-test-secret".to_vec());
        FirebaseTokenVerifier::new(&config).unwrap()
    }

    fn token(claims: &IdTokenClaims, secret: &[u8]) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn claims(aud: &str) -> IdTokenClaims {
        let now = now_unix_secs() as usize;
        IdTokenClaims {
            iss: SESSION_ISSUER.to_string(),
            aud: aud.to_string(),
            sub: "learner-1".to_string(),
            exp: now + 3600,
            iat: Some(now),
            email: Some("learner@example.hu".to_string()),
        }
    }

    #[test]
    fn parse_cache_control_max_age_valid() {
        assert_eq!(
            parse_cache_control_max_age("public, max-age=19204, must-revalidate"),
            Some(19204)
        );
        assert_eq!(parse_cache_control_max_age("max-age=\"120\""), Some(120));
        assert_eq!(parse_cache_control_max_age("no-store"), None);
        assert_eq!(parse_cache_control_max_age("max-age=abc"), None);
    }

    #[test]
    fn extract_bearer_token_variants() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }

    #[tokio::test]
    async fn shared_secret_token_accepted() {
        let verifier = shared_secret_verifier();
        let project = Config::test_default().gcp_project_id;
        let identity = verifier
            .verify(&token(&claims(&project), b"unit-test-secret"))
            .await
            .unwrap();
        assert_eq!(identity.uid, "learner-1");
        assert_eq!(identity.email.as_deref(), Some("learner@example.hu"));
    }

    #[tokio::test]
    async fn wrong_secret_or_audience_rejected() {
        let verifier = shared_secret_verifier();
        let project = Config::test_default().gcp_project_id;

        let forged = token(&claims(&project), b"another-secret");
        assert!(matches!(
            verifier.verify(&forged).await,
            Err(AuthError::Rejected(_))
        ));

        let foreign = token(&claims("some-other-project"), b"unit-test-secret");
        assert!(matches!(
            verifier.verify(&foreign).await,
            Err(AuthError::Rejected(_))
        ));

        assert!(matches!(
            verifier.verify("not-a-jwt").await,
            Err(AuthError::Rejected(_))
        ));
    }
}
