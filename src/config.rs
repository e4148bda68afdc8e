// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Everything is read once at startup. The upstream functions URL has no
//! default: a missing or malformed value stops the server before it binds.

use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which document store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(ConfigError::Invalid(
                "STORE_BACKEND",
                format!("unknown backend '{s}'"),
            )),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the upstream Cloud Functions API (no trailing slash)
    pub functions_base_url: String,
    /// GCP / Firebase project ID
    pub gcp_project_id: String,
    /// Frontend URL allowed by CORS
    pub frontend_url: String,
    /// Server port
    pub port: u16,
    pub store_backend: StoreBackend,
    /// Upper bound for a single document store round trip
    pub store_timeout: Duration,
    /// Upper bound for a call to the upstream functions API
    pub upstream_timeout: Duration,
    /// How long an access decision stays cached
    pub access_cache_ttl: Duration,
    pub access_cache_capacity: usize,
    /// Attempts for enrollment writes before giving up
    pub write_max_attempts: u32,
    pub write_base_delay: Duration,
    /// Calendar used for streaks when the user has no time zone of their own
    pub default_time_zone: Tz,
    /// HS256 key for session tokens (local development / emulator only).
    /// When unset, Firebase ID tokens are required.
    pub auth_shared_secret: Option<Vec<u8>>,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            functions_base_url: "http://127.0.0.1:5001/test-project/europe-west1".to_string(),
            gcp_project_id: "test-project".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            port: 8080,
            store_backend: StoreBackend::Memory,
            store_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(10),
            access_cache_ttl: Duration::from_secs(300),
            access_cache_capacity: 10_000,
            write_max_attempts: 3,
            write_base_delay: Duration::from_millis(1),
            default_time_zone: chrono_tz::Europe::Budapest,
            auth_shared_secret: Some(b"test_jwt_key_32_bytes_minimum!!".to_vec()),
        }
    }
}

impl Config {
    /// Deterministic configuration for tests.
    pub fn test_default() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let functions_base_url = env::var("FUNCTIONS_BASE_URL")
            .map_err(|_| ConfigError::Missing("FUNCTIONS_BASE_URL"))?;
        let functions_base_url = validate_base_url(&functions_base_url)?;

        let default_time_zone = match env::var("DEFAULT_TIME_ZONE") {
            Ok(name) => name.trim().parse::<Tz>().map_err(|_| {
                ConfigError::Invalid("DEFAULT_TIME_ZONE", format!("unknown time zone '{name}'"))
            })?,
            Err(_) => chrono_tz::Europe::Budapest,
        };

        Ok(Self {
            functions_base_url,
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            port: parse_or("PORT", 8080)?,
            store_backend: env::var("STORE_BACKEND")
                .map(|v| v.parse())
                .unwrap_or(Ok(StoreBackend::Firestore))?,
            store_timeout: Duration::from_millis(parse_or("STORE_TIMEOUT_MS", 5_000)?),
            upstream_timeout: Duration::from_millis(parse_or("UPSTREAM_TIMEOUT_MS", 10_000)?),
            access_cache_ttl: Duration::from_secs(parse_or("ACCESS_CACHE_TTL_SECS", 300)?),
            access_cache_capacity: parse_or("ACCESS_CACHE_CAPACITY", 10_000)?,
            write_max_attempts: parse_or("WRITE_MAX_ATTEMPTS", 3)?,
            write_base_delay: Duration::from_millis(parse_or("WRITE_BASE_DELAY_MS", 100)?),
            default_time_zone,
            auth_shared_secret: env::var("AUTH_SHARED_SECRET")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(String::into_bytes),
        })
    }
}

/// Parse an optional numeric variable, rejecting garbage instead of silently
/// falling back.
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, format!("cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(ConfigError::Invalid(
            "FUNCTIONS_BASE_URL",
            "must be an http(s) URL".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
