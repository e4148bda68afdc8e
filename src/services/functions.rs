// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Client for the upstream Cloud Functions API.
//!
//! Webhook signatures are checked upstream (it holds the processor secret);
//! this service forwards the raw body verbatim and relays the answer.

use crate::config::Config;
use crate::error::AppError;
use anyhow::Context;
use axum::body::Bytes;
use axum::http::StatusCode;
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Status and JSON body exactly as the upstream returned them.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub struct FunctionsClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl FunctionsClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .context("failed building functions HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.functions_base_url.clone(),
        })
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/stripeWebhook", self.base_url)
    }

    /// Forward a webhook delivery for signature verification.
    pub async fn verify_webhook(
        &self,
        raw_body: Bytes,
        signature: &str,
    ) -> Result<UpstreamResponse, AppError> {
        let url = self.webhook_url();

        let response = self
            .http_client
            .post(&url)
            .header(SIGNATURE_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(raw_body)
            .send()
            .await
            .map_err(|e| {
                AppError::UpstreamUnavailable(format!("webhook verifier unreachable: {e}"))
            })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let text = response.text().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("failed reading verifier response: {e}"))
        })?;

        let body = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({ "message": text }));

        tracing::debug!(status = status.as_u16(), "Webhook verifier answered");

        Ok(UpstreamResponse { status, body })
    }
}
