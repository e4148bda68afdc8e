// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment processor webhook.

use crate::error::{AppError, Result};
use crate::services::functions::SIGNATURE_HEADER;
use crate::services::payment::ProcessorEvent;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/payment/webhook", post(handle_webhook))
}

/// Receive a processor event.
///
/// The raw body goes upstream for signature verification and the upstream
/// answer is relayed as-is. Once verified, the event is fulfilled locally;
/// a fulfilment write that could not complete turns into a 503 so the
/// processor redelivers.
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::InvalidArgument(format!("missing {SIGNATURE_HEADER} header")))?;

    let upstream = state
        .functions
        .verify_webhook(body.clone(), signature)
        .await?;

    if !upstream.is_success() {
        tracing::warn!(
            status = upstream.status.as_u16(),
            "Webhook rejected by verifier"
        );
        return Ok((upstream.status, Json(upstream.body)).into_response());
    }

    match serde_json::from_slice::<ProcessorEvent>(&body) {
        Ok(event) => match state.checkout.handle_event(&event).await {
            Ok(outcome) => {
                tracing::info!(
                    event_id = event.id.as_deref().unwrap_or("<none>"),
                    event_type = %event.event_type,
                    outcome = ?outcome,
                    "Webhook event handled"
                );
            }
            Err(e) if matches!(e, AppError::WriteFailed(_)) || e.is_transient() => {
                return Err(e);
            }
            Err(e) => {
                // Redelivery cannot fix these (unknown course, bad ids).
                tracing::error!(
                    event_id = event.id.as_deref().unwrap_or("<none>"),
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event could not be fulfilled"
                );
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Verified webhook body is not a processor event");
        }
    }

    Ok((upstream.status, Json(upstream.body)).into_response())
}
