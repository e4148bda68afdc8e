// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Administrative routes: manual enrollment and repairs.

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::routes::extract::ValidatedJson;
use crate::services::reconcile::{CourseStatsReport, ReconcileReport, ReconcileSummary};
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Admin routes. Auth and the admin check are applied in routes/mod.rs.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/enrollments", post(manual_enroll))
        .route("/api/admin/users/{user_id}/reconcile", post(reconcile_user))
        .route("/api/admin/reconcile", post(reconcile_all))
        .route(
            "/api/admin/courses/{course_id}/recompute-stats",
            post(recompute_course_stats),
        )
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ManualEnrollRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 128))]
    pub course_id: String,
    #[validate(length(max = 256))]
    pub payment_session_id: Option<String>,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct ManualEnrollResponse {
    pub enrollment_id: String,
    pub created: bool,
    pub status: String,
    pub enrolled_at: String,
}

/// Grant a course by hand. 201 when new, 200 when the user already had it.
async fn manual_enroll(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<ManualEnrollRequest>,
) -> Result<(StatusCode, Json<ManualEnrollResponse>)> {
    tracing::info!(
        admin = %admin.uid,
        user_id = %req.user_id,
        course_id = %req.course_id,
        "Manual enrollment requested"
    );

    let outcome = state
        .enrollments
        .grant_enrollment(&req.user_id, &req.course_id, req.payment_session_id.as_deref())
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(ManualEnrollResponse {
            enrollment_id: outcome.enrollment.id,
            created: outcome.created,
            status: outcome.enrollment.status.as_str().to_string(),
            enrolled_at: format_utc_rfc3339(outcome.enrollment.enrolled_at),
        }),
    ))
}

async fn reconcile_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<String>,
) -> Result<Json<ReconcileReport>> {
    tracing::info!(admin = %admin.uid, user_id = %user_id, "Reconcile user requested");
    Ok(Json(state.reconciler.reconcile_user(&user_id).await?))
}

async fn reconcile_all(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
) -> Result<Json<ReconcileSummary>> {
    tracing::info!(admin = %admin.uid, "Full reconciliation requested");
    Ok(Json(state.reconciler.reconcile_all().await?))
}

async fn recompute_course_stats(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> Result<Json<CourseStatsReport>> {
    Ok(Json(
        state.reconciler.recompute_course_stats(&course_id).await?,
    ))
}
