// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Progress aggregator: records lesson completions and keeps the per-user
//! rollup in step with the enrollment.

use crate::db::{with_timeout, CourseStore, LearnerDocs, TxnDecision};
use crate::error::AppError;
use crate::models::enrollment::validate_id;
use crate::models::{EnrollmentKey, EnrollmentStatus, UserProgress};
use crate::retry::{retry_transient, RetryPolicy};
use crate::time_utils::{local_day, resolve_time_zone};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of [`ProgressAggregator::record_lesson_completion`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonCompletion {
    /// `false` on replay of an already completed lesson
    pub newly_completed: bool,
    /// Completed fraction, 0.0..=1.0
    pub progress: f64,
    pub completed_lessons: u32,
    pub total_lessons: u32,
    pub status: EnrollmentStatus,
}

pub struct ProgressAggregator {
    store: Arc<dyn CourseStore>,
    retry: RetryPolicy,
    store_timeout: Duration,
    default_time_zone: Tz,
}

impl ProgressAggregator {
    pub fn new(
        store: Arc<dyn CourseStore>,
        retry: RetryPolicy,
        store_timeout: Duration,
        default_time_zone: Tz,
    ) -> Self {
        Self {
            store,
            retry,
            store_timeout,
            default_time_zone,
        }
    }

    pub async fn record_lesson_completion(
        &self,
        user_id: &str,
        course_id: &str,
        lesson_id: &str,
    ) -> Result<LessonCompletion, AppError> {
        let key = EnrollmentKey::new(user_id, course_id)?;
        let lesson_id = validate_id("lessonId", lesson_id)?;

        let result = retry_transient(self.retry, || self.try_record(&key, lesson_id)).await;
        match result {
            Ok((completion, _)) => {
                tracing::info!(
                    user_id = key.user_id(),
                    course_id = key.course_id(),
                    lesson_id,
                    newly_completed = completion.newly_completed,
                    completed_lessons = completion.completed_lessons,
                    total_lessons = completion.total_lessons,
                    "Lesson completion recorded"
                );
                Ok(completion)
            }
            Err((e, attempts)) if e.is_transient() => {
                tracing::error!(
                    user_id = key.user_id(),
                    course_id = key.course_id(),
                    enrollment_id = %key.document_id(),
                    lesson_id,
                    attempts,
                    error = %e,
                    "Lesson completion write failed"
                );
                Err(AppError::WriteFailed(format!(
                    "lesson {} for {} not recorded after {} attempts: {}",
                    lesson_id,
                    key.document_id(),
                    attempts,
                    e
                )))
            }
            Err((e, _)) => Err(e),
        }
    }

    async fn try_record(
        &self,
        key: &EnrollmentKey,
        lesson_id: &str,
    ) -> Result<LessonCompletion, AppError> {
        let course = with_timeout(self.store_timeout, self.store.get_course(key.course_id()))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {}", key.course_id())))?;
        let counts = with_timeout(
            self.store_timeout,
            self.store.count_course_contents(key.course_id()),
        )
        .await?;
        let catalog_lessons = counts.effective_lessons(&course);

        let now = Utc::now();
        let default_tz = self.default_time_zone;
        let newly = AtomicBool::new(false);
        let txn = |docs: &mut LearnerDocs| -> Result<TxnDecision, AppError> {
            let first_time = apply_completion(
                docs,
                key,
                &course.title,
                lesson_id,
                catalog_lessons,
                now,
                default_tz,
            )?;
            newly.store(first_time, Ordering::SeqCst);
            Ok(TxnDecision::Commit)
        };

        let outcome =
            with_timeout(self.store_timeout, self.store.transact_learner(key, &txn)).await?;

        let enrollment = outcome
            .docs
            .enrollment
            .ok_or_else(|| anyhow::anyhow!("learner transaction returned no enrollment"))?;
        let completed = enrollment.completed_lessons.len() as u32;
        Ok(LessonCompletion {
            newly_completed: newly.load(Ordering::SeqCst),
            progress: enrollment.progress,
            completed_lessons: completed,
            total_lessons: catalog_lessons.max(completed),
            status: enrollment.status,
        })
    }
}

/// Pure completion step over a learner snapshot.
///
/// Fails with `NotEnrolled` unless the pair holds a granting enrollment
/// (stray records under other IDs are adopted first). Returns `true` if the
/// lesson was not already completed.
pub fn apply_completion(
    docs: &mut LearnerDocs,
    key: &EnrollmentKey,
    course_title: &str,
    lesson_id: &str,
    catalog_lessons: u32,
    now: DateTime<Utc>,
    default_tz: Tz,
) -> Result<bool, AppError> {
    docs.adopt_legacy_enrollments(key);

    let not_enrolled = || AppError::NotEnrolled {
        user_id: key.user_id().to_string(),
        course_id: key.course_id().to_string(),
    };
    let enrollment = docs.enrollment.as_mut().ok_or_else(not_enrolled)?;
    if !enrollment.status.grants_access() {
        return Err(not_enrolled());
    }

    let newly = enrollment.completed_lessons.insert(lesson_id.to_string());
    enrollment.recompute_progress(catalog_lessons);
    enrollment.last_accessed_at = now;
    enrollment.current_lesson = Some(lesson_id.to_string());
    enrollment.legacy_shape = false;

    if newly
        && catalog_lessons > 0
        && enrollment.completed_lessons.len() as u32 >= catalog_lessons
        && enrollment.status != EnrollmentStatus::Completed
    {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.completed_at = Some(now);
    }
    let snapshot_source = enrollment.clone();

    let tz = resolve_time_zone(
        docs.user.as_ref().and_then(|u| u.time_zone.as_deref()),
        default_tz,
    );

    let mut progress = docs
        .progress
        .take()
        .unwrap_or_else(|| UserProgress::new(key.user_id()));
    progress
        .ensure_course(key.course_id(), course_title)
        .sync_from(&snapshot_source, catalog_lessons);
    if newly {
        progress.bump_streak(local_day(now, tz));
    }
    progress.recount(docs.effective_enrollments());
    progress.updated_at = Some(now);
    docs.progress = Some(progress);

    Ok(newly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Enrollment;
    use chrono::TimeZone;

    fn key() -> EnrollmentKey {
        EnrollmentKey::new("u1", "course-x").unwrap()
    }

    fn enrolled_docs() -> LearnerDocs {
        let enrollment = Enrollment::new_active(&key(), None, Utc::now());
        LearnerDocs {
            enrollment: Some(enrollment.clone()),
            user_enrollments: vec![enrollment],
            ..Default::default()
        }
    }

    const TZ: Tz = chrono_tz::Europe::Budapest;

    #[test]
    fn test_completion_requires_enrollment() {
        let mut docs = LearnerDocs::default();
        let err = apply_completion(&mut docs, &key(), "X", "L1", 17, Utc::now(), TZ).unwrap_err();
        assert!(matches!(err, AppError::NotEnrolled { .. }));

        let mut pending = enrolled_docs();
        pending.enrollment.as_mut().unwrap().status = EnrollmentStatus::Pending;
        let err =
            apply_completion(&mut pending, &key(), "X", "L1", 17, Utc::now(), TZ).unwrap_err();
        assert!(matches!(err, AppError::NotEnrolled { .. }));
    }

    #[test]
    fn test_replay_does_not_double_count() {
        let mut docs = enrolled_docs();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        assert!(apply_completion(&mut docs, &key(), "X", "L1", 17, t1, TZ).unwrap());
        assert!(!apply_completion(&mut docs, &key(), "X", "L1", 17, t2, TZ).unwrap());

        let enrollment = docs.enrollment.as_ref().unwrap();
        assert_eq!(enrollment.completed_lessons.len(), 1);
        assert_eq!(enrollment.progress, 1.0 / 17.0);
        assert_eq!(enrollment.last_accessed_at, t2);

        let progress = docs.progress.as_ref().unwrap();
        assert_eq!(progress.total_lessons_completed, 1);
        assert_eq!(progress.current_streak, 1);
        assert_eq!(progress.snapshot("course-x").unwrap().percentage, 6);
    }

    #[test]
    fn test_last_lesson_completes_course() {
        let mut docs = enrolled_docs();
        let now = Utc::now();
        apply_completion(&mut docs, &key(), "X", "L1", 2, now, TZ).unwrap();
        assert_eq!(
            docs.enrollment.as_ref().unwrap().status,
            EnrollmentStatus::Active
        );
        apply_completion(&mut docs, &key(), "X", "L2", 2, now, TZ).unwrap();
        let enrollment = docs.enrollment.as_ref().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.progress, 1.0);
        assert!(enrollment.completed_at.is_some());
        // Completed still counts as enrolled.
        assert_eq!(docs.progress.as_ref().unwrap().total_courses_enrolled, 1);
    }

    #[test]
    fn test_empty_catalog_never_completes() {
        let mut docs = enrolled_docs();
        apply_completion(&mut docs, &key(), "X", "L1", 0, Utc::now(), TZ).unwrap();
        assert_eq!(
            docs.enrollment.as_ref().unwrap().status,
            EnrollmentStatus::Active
        );
    }

    #[test]
    fn test_streak_uses_local_day() {
        let mut docs = enrolled_docs();
        // 23:30 UTC on Mar 1 is already Mar 2 in Budapest; 08:00 UTC Mar 2
        // is the same local day, so the streak stays at 1.
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        apply_completion(&mut docs, &key(), "X", "L1", 17, late, TZ).unwrap();
        apply_completion(&mut docs, &key(), "X", "L2", 17, next, TZ).unwrap();
        assert_eq!(docs.progress.as_ref().unwrap().current_streak, 1);

        let mut utc_docs = enrolled_docs();
        apply_completion(&mut utc_docs, &key(), "X", "L1", 17, late, chrono_tz::UTC).unwrap();
        apply_completion(&mut utc_docs, &key(), "X", "L2", 17, next, chrono_tz::UTC).unwrap();
        assert_eq!(utc_docs.progress.as_ref().unwrap().current_streak, 2);
    }
}
