// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Reconciliation of drifted enrollment state, end to end.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use course_enrollment::db::{
    collections, CourseStore, InMemoryStore, LearnerTxn, ReconcileOutcome, ReconcileTxn,
    TxnOutcome,
};
use course_enrollment::error::AppError;
use course_enrollment::models::{
    Course, CourseContentCounts, Enrollment, EnrollmentKey, EnrollmentStatus, Payment, Role, User,
    UserProgress,
};
use course_enrollment::retry::RetryPolicy;
use course_enrollment::services::{AccessCache, Reconciler};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;

mod common;

/// One user as older write paths left them: two auto-ID records for the
/// same course, a pending canonical record still listed on the user, a
/// listed course with no enrollment at all, and inflated counters.
async fn seed_drifted_user(store: &InMemoryStore) {
    common::seed_course(store, "course-x", "Course X", 4).await;
    common::seed_course(store, "course-y", "Course Y", 2).await;
    common::seed_course(store, "course-z", "Course Z", 2).await;

    store
        .put_raw(
            collections::USERS,
            "u1",
            json!({
                "email": "u1@example.hu",
                "role": "STUDENT",
                "courseAccess": true,
                "enrolledCourses": ["course-x", "course-y", "course-z", "course-x"],
                "createdAt": "2025-09-01T08:00:00Z"
            }),
        )
        .await;
    store
        .put_raw(
            collections::ENROLLMENTS,
            "autoA",
            json!({
                "userId": "u1",
                "courseId": "course-x",
                "status": "active",
                "enrolledAt": "2025-10-01T08:00:00Z",
                "progress": 25,
                "completedLessons": ["course-x-l1"]
            }),
        )
        .await;
    store
        .put_raw(
            collections::ENROLLMENTS,
            "autoB",
            json!({
                "userId": "u1",
                "courseId": "course-x",
                "status": "ACTIVE",
                "enrolledAt": "2025-10-03T08:00:00Z",
                "progress": { "completedLessons": ["course-x-l2"], "totalProgress": 25 }
            }),
        )
        .await;
    store
        .put_raw(
            collections::ENROLLMENTS,
            "u1_course-y",
            json!({
                "userId": "u1",
                "courseId": "course-y",
                "status": "PENDING",
                "enrolledAt": "2025-10-05T08:00:00Z"
            }),
        )
        .await;
    store
        .put_raw(
            collections::USER_PROGRESS,
            "u1",
            json!({
                "userId": "u1",
                "totalCoursesEnrolled": 7,
                "totalLessonsCompleted": 0,
                "enrolledCourses": [
                    { "courseId": "course-x", "title": "Course X", "percentage": 25 },
                    { "courseId": "course-x", "title": "Course X", "percentage": 0 },
                    { "courseId": "course-y", "title": "Course Y" }
                ]
            }),
        )
        .await;
}

#[tokio::test]
async fn test_reconcile_user_repairs_drift() {
    let (_, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;

    let report = state.reconciler.reconcile_user("u1").await.unwrap();
    assert!(report.changed);
    assert_eq!(report.merged_duplicates, 2);
    let mut deleted = report.deleted_ids.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["autoA".to_string(), "autoB".to_string()]);
    assert_eq!(report.backfilled, 1);
    assert!(report.user_repaired);
    assert!(report.progress_repaired);

    let mut ids = store.ids(collections::ENROLLMENTS).await;
    ids.sort();
    assert_eq!(ids, vec!["u1_course-x", "u1_course-y", "u1_course-z"]);

    let merged = store.get_enrollment("u1_course-x").await.unwrap().unwrap();
    assert_eq!(merged.status, EnrollmentStatus::Active);
    assert_eq!(merged.completed_lessons.len(), 2);
    assert_eq!(merged.progress, 0.5);
    assert_eq!(merged.enrolled_at.to_rfc3339(), "2025-10-01T08:00:00+00:00");

    let backfilled = store.get_enrollment("u1_course-z").await.unwrap().unwrap();
    assert_eq!(backfilled.status, EnrollmentStatus::Active);
    assert_eq!(backfilled.enrolled_at.to_rfc3339(), "2025-09-01T08:00:00+00:00");

    let user = store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.enrolled_courses, vec!["course-x", "course-z"]);
    assert!(user.course_access);

    let progress = store.get_user_progress("u1").await.unwrap().unwrap();
    assert_eq!(progress.total_courses_enrolled, 2);
    assert_eq!(progress.total_lessons_completed, 2);
    assert_eq!(progress.enrolled_courses.len(), 2);
    assert_eq!(progress.snapshot("course-x").unwrap().percentage, 50);
    assert!(progress.snapshot("course-y").is_none());

    // The pending enrollment does not grant; the old courseAccess flag does.
    let decision = state.access.has_access("u1", "course-y").await.unwrap();
    assert!(decision.granted);
    assert_eq!(
        decision.reason,
        course_enrollment::services::AccessReason::LegacyAccessFlag
    );
}

#[tokio::test]
async fn test_reconcile_user_is_idempotent() {
    let (_, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;

    state.reconciler.reconcile_user("u1").await.unwrap();
    let commits = store.commit_count();
    let before: Vec<Option<Value>> = vec![
        store.raw(collections::USERS, "u1").await,
        store.raw(collections::ENROLLMENTS, "u1_course-x").await,
        store.raw(collections::USER_PROGRESS, "u1").await,
    ];

    let second = state.reconciler.reconcile_user("u1").await.unwrap();
    assert!(!second.changed);
    assert_eq!(second.merged_duplicates, 0);
    assert_eq!(store.commit_count(), commits);

    let after: Vec<Option<Value>> = vec![
        store.raw(collections::USERS, "u1").await,
        store.raw(collections::ENROLLMENTS, "u1_course-x").await,
        store.raw(collections::USER_PROGRESS, "u1").await,
    ];
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_reconcile_unknown_user() {
    let (_, state, _) = common::create_test_app();
    let err = state.reconciler.reconcile_user("ghost").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_reconcile_all_counts_repairs() {
    let (_, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;
    common::seed_user(&store, "u2", Role::Student).await;

    let summary = state.reconciler.reconcile_all().await.unwrap();
    assert_eq!(summary.users_scanned, 2);
    assert_eq!(summary.users_repaired, 1);
    assert!(summary.failures.is_empty());

    let summary = state.reconciler.reconcile_all().await.unwrap();
    assert_eq!(summary.users_repaired, 0);
}

#[tokio::test]
async fn test_recompute_course_stats() {
    let (_, state, store) = common::create_test_app();
    store
        .put_raw(
            collections::COURSES,
            "course-x",
            json!({ "title": "Course X", "moduleCount": 9, "lessonCount": 40 }),
        )
        .await;
    store.put_module("course-x", "m1").await;
    store.put_module("course-x", "m2").await;
    for lesson in ["l1", "l2", "l3"] {
        store.put_lesson("course-x", "m1", lesson).await;
    }

    let report = state
        .reconciler
        .recompute_course_stats("course-x")
        .await
        .unwrap();
    assert_eq!(report.previous_modules, 9);
    assert_eq!(report.previous_lessons, 40);
    assert_eq!(report.modules, 2);
    assert_eq!(report.lessons, 3);
    assert!(report.changed);

    let course = store.get_course("course-x").await.unwrap().unwrap();
    assert_eq!(course.total_modules, 2);
    assert_eq!(course.total_lessons, 3);
    assert!(course.stats_updated_at.is_some());

    let again = state
        .reconciler
        .recompute_course_stats("course-x")
        .await
        .unwrap();
    assert!(!again.changed);

    let err = state
        .reconciler
        .recompute_course_stats("missing")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_admin_reconcile_route() {
    let (app, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;
    common::seed_user(&store, "boss", Role::Admin).await;
    let token = common::test_token(&state, "boss");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/users/u1/reconcile")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 64)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["userId"], "u1");
    assert_eq!(json["changed"], true);
    assert_eq!(json["backfilled"], 1);
}

#[tokio::test]
async fn test_reconcile_retries_commit_conflicts() {
    let (_, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;
    store.fail_next_commits(2);

    let report = state.reconciler.reconcile_user("u1").await.unwrap();
    assert!(report.changed);
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.ids(collections::ENROLLMENTS).await.len(), 3);
}

/// In-memory store that lets another writer commit a raw document just
/// before the first reconciliation transaction reads.
struct WriterBeforeReconcile {
    inner: Arc<InMemoryStore>,
    pending: Mutex<Option<(&'static str, String, Value)>>,
}

#[async_trait]
impl CourseStore for WriterBeforeReconcile {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.inner.get_user(user_id).await
    }

    async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        self.inner.upsert_user(user).await
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, AppError> {
        self.inner.list_user_ids().await
    }

    async fn get_course(&self, course_id: &str) -> Result<Option<Course>, AppError> {
        self.inner.get_course(course_id).await
    }

    async fn upsert_course(&self, course: &Course) -> Result<(), AppError> {
        self.inner.upsert_course(course).await
    }

    async fn count_course_contents(
        &self,
        course_id: &str,
    ) -> Result<CourseContentCounts, AppError> {
        self.inner.count_course_contents(course_id).await
    }

    async fn get_enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>, AppError> {
        self.inner.get_enrollment(enrollment_id).await
    }

    async fn find_enrollments(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<Enrollment>, AppError> {
        self.inner.find_enrollments(user_id, course_id).await
    }

    async fn list_user_enrollments(&self, user_id: &str) -> Result<Vec<Enrollment>, AppError> {
        self.inner.list_user_enrollments(user_id).await
    }

    async fn get_user_progress(&self, user_id: &str) -> Result<Option<UserProgress>, AppError> {
        self.inner.get_user_progress(user_id).await
    }

    async fn get_payment(&self, session_id: &str) -> Result<Option<Payment>, AppError> {
        self.inner.get_payment(session_id).await
    }

    async fn upsert_payment(&self, payment: &Payment) -> Result<(), AppError> {
        self.inner.upsert_payment(payment).await
    }

    async fn transact_learner(
        &self,
        key: &EnrollmentKey,
        apply: &LearnerTxn<'_>,
    ) -> Result<TxnOutcome, AppError> {
        self.inner.transact_learner(key, apply).await
    }

    async fn transact_reconciliation(
        &self,
        user_id: &str,
        plan: &ReconcileTxn<'_>,
    ) -> Result<ReconcileOutcome, AppError> {
        if let Some((collection, id, value)) = self.pending.lock().await.take() {
            self.inner.put_raw(collection, &id, value).await;
        }
        self.inner.transact_reconciliation(user_id, plan).await
    }
}

#[tokio::test]
async fn test_reconcile_keeps_lesson_completed_after_first_read() {
    let inner = Arc::new(InMemoryStore::new());
    common::seed_course(&inner, "course-x", "Course X", 4).await;
    inner
        .put_raw(
            collections::USERS,
            "u1",
            json!({ "role": "STUDENT", "enrolledCourses": ["course-x"], "courseAccess": true }),
        )
        .await;
    inner
        .put_raw(
            collections::ENROLLMENTS,
            "u1_course-x",
            json!({
                "userId": "u1",
                "courseId": "course-x",
                "status": "active",
                "enrolledAt": "2025-10-01T08:00:00Z",
                "progress": 25,
                "completedLessons": ["course-x-l1"]
            }),
        )
        .await;

    // A lesson completion that commits after the reconciler has looked
    // the user up but before its transaction runs.
    let completed = (
        collections::ENROLLMENTS,
        "u1_course-x".to_string(),
        json!({
            "userId": "u1",
            "courseId": "course-x",
            "status": "active",
            "enrolledAt": "2025-10-01T08:00:00Z",
            "progress": 50,
            "completedLessons": ["course-x-l1", "course-x-l2"]
        }),
    );
    let store = Arc::new(WriterBeforeReconcile {
        inner: inner.clone(),
        pending: Mutex::new(Some(completed)),
    });
    let reconciler = Reconciler::new(
        store,
        Arc::new(AccessCache::new(Duration::from_secs(60), 100)),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        Duration::from_secs(5),
    );

    let report = reconciler.reconcile_user("u1").await.unwrap();
    assert!(report.changed);

    let enrollment = inner.get_enrollment("u1_course-x").await.unwrap().unwrap();
    assert_eq!(enrollment.completed_lessons.len(), 2);
    assert!(enrollment.completed_lessons.contains("course-x-l2"));
    assert_eq!(enrollment.progress, 0.5);

    let progress = inner.get_user_progress("u1").await.unwrap().unwrap();
    assert_eq!(progress.total_lessons_completed, 2);
    assert_eq!(progress.snapshot("course-x").unwrap().percentage, 50);
}

#[tokio::test]
async fn test_reconcile_keeps_fields_owned_by_other_clients() {
    let (_, state, store) = common::create_test_app();
    seed_drifted_user(&store).await;
    let mut user = store.raw(collections::USERS, "u1").await.unwrap();
    user["firstName"] = json!("Anna");
    user["stripeCustomerId"] = json!("cus_123");
    store.put_raw(collections::USERS, "u1", user).await;

    state.reconciler.reconcile_user("u1").await.unwrap();

    let user = store.raw(collections::USERS, "u1").await.unwrap();
    assert_eq!(user["firstName"], "Anna");
    assert_eq!(user["stripeCustomerId"], "cus_123");
    assert_eq!(user["enrolledCourses"], json!(["course-x", "course-z"]));
}
