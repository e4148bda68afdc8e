// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Learner dashboard routes.

use crate::db::with_timeout;
use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::models::enrollment::merge_enrollments;
use crate::models::{Enrollment, EnrollmentKey, User, UserProgress};
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{extract::State, routing::get, Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Dashboard routes (require authentication).
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/me/progress", get(get_progress))
        .route("/api/me/enrollments", get(get_enrollments))
}

// ─── Profile ─────────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: String,
    pub course_access: bool,
    pub enrolled_courses: Vec<String>,
    pub time_zone: Option<String>,
}

/// Current user. A signed-in user without a profile document yet gets the
/// defaults a new student would have.
async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<MeResponse>> {
    let profile = with_timeout(state.config.store_timeout, state.store.get_user(&user.uid))
        .await?
        .unwrap_or_else(|| User::stub(&user.uid, Utc::now()));

    Ok(Json(MeResponse {
        uid: user.uid,
        email: profile.email.or(user.email),
        display_name: profile.display_name,
        role: profile.role.as_str().to_string(),
        course_access: profile.course_access,
        enrolled_courses: profile.enrolled_courses,
        time_zone: profile.time_zone,
    }))
}

// ─── Progress ────────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgressResponse {
    pub course_id: String,
    pub title: String,
    pub percentage: u32,
    pub completed_lessons: u32,
    pub total_lessons: u32,
    pub last_activity_at: Option<String>,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub total_courses_enrolled: u32,
    pub total_lessons_completed: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_streak_date: Option<String>,
    pub courses: Vec<CourseProgressResponse>,
}

impl From<UserProgress> for ProgressResponse {
    fn from(p: UserProgress) -> Self {
        Self {
            total_courses_enrolled: p.total_courses_enrolled,
            total_lessons_completed: p.total_lessons_completed,
            current_streak: p.current_streak,
            longest_streak: p.longest_streak,
            last_streak_date: p.last_streak_date.map(|d| d.format("%Y-%m-%d").to_string()),
            courses: p
                .enrolled_courses
                .into_iter()
                .map(|s| CourseProgressResponse {
                    course_id: s.course_id,
                    title: s.title,
                    percentage: s.percentage,
                    completed_lessons: s.completed_lessons,
                    total_lessons: s.total_lessons,
                    last_activity_at: s.last_activity_at.map(format_utc_rfc3339),
                })
                .collect(),
        }
    }
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ProgressResponse>> {
    let progress = with_timeout(
        state.config.store_timeout,
        state.store.get_user_progress(&user.uid),
    )
    .await?
    .unwrap_or_else(|| UserProgress::new(&user.uid));

    Ok(Json(progress.into()))
}

// ─── Enrollments ─────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResponse {
    pub id: String,
    pub course_id: String,
    pub status: String,
    pub has_access: bool,
    pub progress: f64,
    pub percentage: u32,
    pub completed_lessons: Vec<String>,
    pub current_lesson: Option<String>,
    pub enrolled_at: String,
    pub last_accessed_at: String,
    pub completed_at: Option<String>,
}

impl From<Enrollment> for EnrollmentResponse {
    fn from(e: Enrollment) -> Self {
        Self {
            percentage: e.percentage(),
            has_access: e.status.grants_access(),
            status: e.status.as_str().to_string(),
            id: e.id,
            course_id: e.course_id,
            progress: e.progress,
            completed_lessons: e.completed_lessons.into_iter().collect(),
            current_lesson: e.current_lesson,
            enrolled_at: format_utc_rfc3339(e.enrolled_at),
            last_accessed_at: format_utc_rfc3339(e.last_accessed_at),
            completed_at: e.completed_at.map(format_utc_rfc3339),
        }
    }
}

/// The user's enrollments, one per course. Records still filed under old
/// IDs are shown merged, as they will look after reconciliation.
async fn get_enrollments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<EnrollmentResponse>>> {
    let enrollments = with_timeout(
        state.config.store_timeout,
        state.store.list_user_enrollments(&user.uid),
    )
    .await?;

    let mut by_course: BTreeMap<String, Vec<Enrollment>> = BTreeMap::new();
    for enrollment in enrollments {
        by_course
            .entry(enrollment.course_id.clone())
            .or_default()
            .push(enrollment);
    }

    let merged = by_course
        .into_iter()
        .filter_map(|(course_id, records)| {
            let key = EnrollmentKey::new(&user.uid, &course_id).ok()?;
            merge_enrollments(&key, &records)
        })
        .map(EnrollmentResponse::from)
        .collect();

    Ok(Json(merged))
}
