// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Course access and lesson progress routes.

use crate::error::{AppError, Result};
use crate::middleware::auth::{authenticate, is_admin, AuthUser};
use crate::services::access::AccessDecision;
use crate::services::firebase_auth::extract_bearer_token;
use crate::services::progress::LessonCompletion;
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Routes callable without a session (the token is optional).
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/courses/{course_id}/is-enrolled", get(is_enrolled))
}

/// Routes for the signed-in learner. Auth is applied in routes/mod.rs.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/courses/{course_id}/access", get(get_access))
        .route(
            "/api/courses/{course_id}/lessons/{lesson_id}/complete",
            post(complete_lesson),
        )
}

/// Access check result.
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCheckResponse {
    pub enrolled: bool,
    pub reason: String,
    pub granted_at: Option<String>,
    /// The check could not be completed; retry instead of showing "no access".
    pub retryable: bool,
}

impl From<AccessDecision> for EnrollmentCheckResponse {
    fn from(decision: AccessDecision) -> Self {
        Self {
            enrolled: decision.granted,
            reason: decision.reason.as_str().to_string(),
            granted_at: decision.granted_at.map(format_utc_rfc3339),
            retryable: decision.retryable,
        }
    }
}

fn check_response(decision: AccessDecision, unavailable_status: StatusCode) -> Response {
    let status = if decision.retryable {
        unavailable_status
    } else {
        StatusCode::OK
    };
    (status, Json(EnrollmentCheckResponse::from(decision))).into_response()
}

#[derive(Debug, Deserialize)]
struct IsEnrolledParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Is `userId` enrolled in the course?
///
/// A bearer token is optional. When present it must belong to `userId`, or
/// to an admin.
async fn is_enrolled(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
    Query(params): Query<IsEnrolledParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let user_id = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AppError::InvalidArgument("userId is required".to_string()))?;

    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let token = value
            .to_str()
            .ok()
            .and_then(extract_bearer_token)
            .ok_or(AppError::InvalidToken)?;
        let caller = authenticate(&state, token).await?;
        if caller.uid != user_id && !is_admin(&state, &caller.uid).await? {
            tracing::warn!(
                caller = %caller.uid,
                user_id = %user_id,
                course_id = %course_id,
                "Enrollment check for another user denied"
            );
            return Err(AppError::Forbidden(
                "token does not belong to userId".to_string(),
            ));
        }
    }

    let decision = state.access.has_access(&user_id, &course_id).await?;
    Ok(check_response(decision, StatusCode::INTERNAL_SERVER_ERROR))
}

/// Access check for the signed-in user.
async fn get_access(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
) -> Result<Response> {
    let decision = state.access.has_access(&user.uid, &course_id).await?;
    Ok(check_response(decision, StatusCode::SERVICE_UNAVAILABLE))
}

/// Lesson completion result.
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct LessonCompletionResponse {
    pub newly_completed: bool,
    pub progress: f64,
    pub percentage: u32,
    pub completed_lessons: u32,
    pub total_lessons: u32,
    pub status: String,
}

impl From<LessonCompletion> for LessonCompletionResponse {
    fn from(c: LessonCompletion) -> Self {
        Self {
            newly_completed: c.newly_completed,
            percentage: (c.progress * 100.0).round().clamp(0.0, 100.0) as u32,
            progress: c.progress,
            completed_lessons: c.completed_lessons,
            total_lessons: c.total_lessons,
            status: c.status.as_str().to_string(),
        }
    }
}

async fn complete_lesson(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((course_id, lesson_id)): Path<(String, String)>,
) -> Result<Json<LessonCompletionResponse>> {
    let completion = state
        .progress
        .record_lesson_completion(&user.uid, &course_id, &lesson_id)
        .await?;
    Ok(Json(completion.into()))
}
