// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Enrollment writer: grants a user a course.
//!
//! The enrollment, the user's `enrolledCourses` cache and the progress
//! rollup are updated in one transaction. A grant for a pair that already
//! holds an ACTIVE or COMPLETED canonical enrollment writes nothing, so
//! redelivered payment events are harmless.

use crate::db::{with_timeout, CourseStore, LearnerDocs, TxnDecision};
use crate::error::AppError;
use crate::models::enrollment::validate_id;
use crate::models::{Enrollment, EnrollmentKey, EnrollmentStatus, User, UserProgress};
use crate::retry::{retry_transient, RetryPolicy};
use crate::services::access::AccessCache;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of [`EnrollmentWriter::grant_enrollment`].
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub enrollment: Enrollment,
    /// `false` when the user already owned the course.
    pub created: bool,
}

pub struct EnrollmentWriter {
    store: Arc<dyn CourseStore>,
    cache: Arc<AccessCache>,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl EnrollmentWriter {
    pub fn new(
        store: Arc<dyn CourseStore>,
        cache: Arc<AccessCache>,
        retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            retry,
            store_timeout,
        }
    }

    /// Grant `course_id` to `user_id`, idempotently.
    pub async fn grant_enrollment(
        &self,
        user_id: &str,
        course_id: &str,
        payment_session_id: Option<&str>,
    ) -> Result<GrantOutcome, AppError> {
        let key = EnrollmentKey::new(user_id, course_id)?;
        let session = match payment_session_id.map(str::trim) {
            Some("") | None => None,
            Some(s) => Some(validate_id("paymentSessionId", s)?),
        };

        let result = retry_transient(self.retry, || self.try_grant(&key, session)).await;

        match result {
            Ok((outcome, attempts)) => {
                self.cache.invalidate(key.user_id(), key.course_id());
                tracing::info!(
                    user_id = key.user_id(),
                    course_id = key.course_id(),
                    enrollment_id = %outcome.enrollment.id,
                    payment_session_id = session,
                    created = outcome.created,
                    attempts,
                    "Enrollment granted"
                );
                Ok(outcome)
            }
            Err((e, attempts)) if e.is_transient() => {
                tracing::error!(
                    user_id = key.user_id(),
                    course_id = key.course_id(),
                    enrollment_id = %key.document_id(),
                    payment_session_id = session,
                    attempts,
                    error = %e,
                    "Enrollment write failed, manual reconciliation may be needed"
                );
                Err(AppError::WriteFailed(format!(
                    "enrollment {} not written after {} attempts: {}",
                    key.document_id(),
                    attempts,
                    e
                )))
            }
            Err((e, _)) => Err(e),
        }
    }

    async fn try_grant(
        &self,
        key: &EnrollmentKey,
        session: Option<&str>,
    ) -> Result<GrantOutcome, AppError> {
        let course = with_timeout(self.store_timeout, self.store.get_course(key.course_id()))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {}", key.course_id())))?;

        let now = Utc::now();
        let created = AtomicBool::new(false);
        let txn = |docs: &mut LearnerDocs| -> Result<TxnDecision, AppError> {
            let already_owned = docs
                .user_enrollments
                .iter()
                .any(|e| e.course_id == key.course_id() && e.status.grants_access());
            let decision = apply_grant(docs, key, &course.title, session, now);
            created.store(
                decision == TxnDecision::Commit && !already_owned,
                Ordering::SeqCst,
            );
            Ok(decision)
        };

        let outcome =
            with_timeout(self.store_timeout, self.store.transact_learner(key, &txn)).await?;

        let enrollment = outcome
            .docs
            .enrollment
            .ok_or_else(|| anyhow::anyhow!("learner transaction returned no enrollment"))?;
        Ok(GrantOutcome {
            enrollment,
            created: outcome.committed && created.load(Ordering::SeqCst),
        })
    }
}

/// Pure grant step over a learner snapshot.
///
/// Returns [`TxnDecision::Skip`] when the canonical enrollment already
/// grants access. Otherwise folds stray records into the canonical one,
/// (re)activates it, and brings the user document and progress rollup in
/// line.
pub fn apply_grant(
    docs: &mut LearnerDocs,
    key: &EnrollmentKey,
    course_title: &str,
    payment_session_id: Option<&str>,
    now: DateTime<Utc>,
) -> TxnDecision {
    if docs
        .enrollment
        .as_ref()
        .is_some_and(|e| e.status.grants_access())
    {
        return TxnDecision::Skip;
    }

    docs.adopt_legacy_enrollments(key);

    let enrollment = match docs.enrollment.take() {
        Some(mut existing) => {
            if !existing.status.grants_access() {
                existing.status = EnrollmentStatus::Active;
                existing.completed_at = None;
            }
            if existing.payment_session_id.is_none() {
                existing.payment_session_id = payment_session_id.map(str::to_string);
            }
            existing.last_accessed_at = now;
            existing.legacy_shape = false;
            existing
        }
        None => Enrollment::new_active(key, payment_session_id, now),
    };
    docs.enrollment = Some(enrollment);

    let user = docs
        .user
        .get_or_insert_with(|| User::stub(key.user_id(), now));
    user.add_enrolled_course(key.course_id());
    user.course_access = true;
    user.updated_at = Some(now);

    let mut progress = docs
        .progress
        .take()
        .unwrap_or_else(|| UserProgress::new(key.user_id()));
    progress.ensure_course(key.course_id(), course_title);
    progress.recount(docs.effective_enrollments());
    progress.updated_at = Some(now);
    docs.progress = Some(progress);

    TxnDecision::Commit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EnrollmentKey {
        EnrollmentKey::new("u1", "course-x").unwrap()
    }

    #[test]
    fn test_apply_grant_fresh_user() {
        let mut docs = LearnerDocs::default();
        let decision = apply_grant(&mut docs, &key(), "Course X", Some("sess_1"), Utc::now());

        assert_eq!(decision, TxnDecision::Commit);
        let enrollment = docs.enrollment.as_ref().unwrap();
        assert_eq!(enrollment.id, "u1_course-x");
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.payment_session_id.as_deref(), Some("sess_1"));

        let user = docs.user.as_ref().unwrap();
        assert!(user.course_access);
        assert_eq!(user.enrolled_courses, vec!["course-x".to_string()]);

        let progress = docs.progress.as_ref().unwrap();
        assert_eq!(progress.total_courses_enrolled, 1);
        assert_eq!(progress.enrolled_courses.len(), 1);
        assert_eq!(progress.enrolled_courses[0].title, "Course X");
    }

    #[test]
    fn test_apply_grant_skips_active_enrollment() {
        let existing = Enrollment::new_active(&key(), Some("sess_1"), Utc::now());
        let mut docs = LearnerDocs {
            enrollment: Some(existing.clone()),
            user_enrollments: vec![existing],
            ..Default::default()
        };
        let decision = apply_grant(&mut docs, &key(), "Course X", Some("sess_2"), Utc::now());
        assert_eq!(decision, TxnDecision::Skip);
        assert!(docs.user.is_none());
        assert!(docs.progress.is_none());
    }

    #[test]
    fn test_apply_grant_reactivates_pending_and_counts_once() {
        let now = Utc::now();
        let mut pending = Enrollment::new_active(&key(), None, now);
        pending.status = EnrollmentStatus::Pending;
        let other =
            Enrollment::new_active(&EnrollmentKey::new("u1", "course-y").unwrap(), None, now);

        let mut progress = UserProgress::new("u1");
        progress.total_courses_enrolled = 1;
        progress.ensure_course("course-y", "Course Y");

        let mut user = User::stub("u1", now);
        user.add_enrolled_course("course-y");

        let mut docs = LearnerDocs {
            user: Some(user),
            enrollment: Some(pending.clone()),
            user_enrollments: vec![pending, other],
            progress: Some(progress),
            retired_enrollment_ids: Vec::new(),
        };

        assert_eq!(
            apply_grant(&mut docs, &key(), "Course X", Some("sess_1"), now),
            TxnDecision::Commit
        );
        assert_eq!(
            docs.enrollment.as_ref().unwrap().status,
            EnrollmentStatus::Active
        );
        assert_eq!(docs.progress.as_ref().unwrap().total_courses_enrolled, 2);
        assert_eq!(docs.user.as_ref().unwrap().enrolled_courses.len(), 2);
    }

    #[test]
    fn test_apply_grant_adopts_legacy_id() {
        let now = Utc::now();
        let mut stray = Enrollment::new_active(&key(), None, now);
        stray.id = "legacyAutoId".to_string();
        stray.completed_lessons.insert("l1".to_string());

        let mut docs = LearnerDocs {
            user_enrollments: vec![stray],
            ..Default::default()
        };
        assert_eq!(
            apply_grant(&mut docs, &key(), "Course X", Some("sess_1"), now),
            TxnDecision::Commit
        );
        let enrollment = docs.enrollment.as_ref().unwrap();
        assert_eq!(enrollment.id, "u1_course-x");
        assert!(enrollment.completed_lessons.contains("l1"));
        assert_eq!(docs.retired_enrollment_ids, vec!["legacyAutoId".to_string()]);
        assert_eq!(docs.progress.as_ref().unwrap().total_courses_enrolled, 1);
    }
}
