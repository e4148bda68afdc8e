// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Repair operations for enrollment state that drifted before the
//! canonical-ID rules existed.
//!
//! Reconciliation of one user is planned as a pure function over that
//! user's documents, read and written back in one store transaction. A
//! concurrent grant or lesson completion aborts the commit and the plan is
//! recomputed. Running it twice in a row writes nothing the second time.

use crate::db::{with_timeout, CourseStore, ReconcilePlan, UserDocs};
use crate::error::AppError;
use crate::models::enrollment::{merge_enrollments, validate_id};
use crate::models::{
    CourseContentCounts, CourseProgressSnapshot, Enrollment, EnrollmentKey, User, UserProgress,
};
use crate::retry::{retry_transient, RetryPolicy};
use crate::services::access::AccessCache;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "binding-generation")]
use ts_rs::TS;

const DEFAULT_CONCURRENCY: usize = 8;

/// Catalog facts reconciliation needs per course.
#[derive(Debug, Clone, Default)]
pub struct CourseFacts {
    pub title: String,
    /// Effective lesson total, 0 when unknown
    pub total_lessons: u32,
}

/// What [`Reconciler::reconcile_user`] found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub user_id: String,
    /// Enrollments found under a non-canonical ID
    pub merged_duplicates: u32,
    pub deleted_ids: Vec<String>,
    pub rewritten_enrollments: u32,
    /// Canonical enrollments created for courses only listed on the user
    pub backfilled: u32,
    pub user_repaired: bool,
    pub progress_repaired: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub user_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub users_scanned: u32,
    pub users_repaired: u32,
    pub failures: Vec<ReconcileFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct CourseStatsReport {
    pub course_id: String,
    pub previous_modules: u32,
    pub previous_lessons: u32,
    pub modules: u32,
    pub lessons: u32,
    pub changed: bool,
}

pub struct Reconciler {
    store: Arc<dyn CourseStore>,
    cache: Arc<AccessCache>,
    retry: RetryPolicy,
    store_timeout: Duration,
    concurrency: usize,
}

impl Reconciler {
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
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Bring one user's enrollments, user document and progress rollup
    /// into canonical form.
    pub async fn reconcile_user(&self, user_id: &str) -> Result<ReconcileReport, AppError> {
        let user_id = validate_id("userId", user_id)?;
        let t = self.store_timeout;

        // This first read only finds the user and the courses whose catalog
        // facts the plan needs. The plan itself is made from documents read
        // inside the transaction.
        let user = with_timeout(t, self.store.get_user(user_id)).await?;
        let enrollments = with_timeout(t, self.store.list_user_enrollments(user_id)).await?;
        let progress = with_timeout(t, self.store.get_user_progress(user_id)).await?;

        if user.is_none() && enrollments.is_empty() && progress.is_none() {
            return Err(AppError::NotFound(format!("user {user_id}")));
        }

        let mut course_ids: Vec<String> = enrollments.iter().map(|e| e.course_id.clone()).collect();
        if let Some(user) = &user {
            course_ids.extend(user.enrolled_courses.iter().cloned());
        }
        course_ids.sort();
        course_ids.dedup();

        let catalog = self.load_course_facts(course_ids).await?;

        let (report, _) = retry_transient(self.retry, || self.try_reconcile(user_id, &catalog))
            .await
            .map_err(|(e, attempts)| {
                tracing::error!(user_id, attempts, error = %e, "Reconciliation not committed");
                e
            })?;

        if report.changed {
            self.cache.invalidate_user(user_id);
            tracing::info!(
                user_id,
                merged_duplicates = report.merged_duplicates,
                deleted = report.deleted_ids.len(),
                rewritten = report.rewritten_enrollments,
                backfilled = report.backfilled,
                user_repaired = report.user_repaired,
                progress_repaired = report.progress_repaired,
                "User enrollment state reconciled"
            );
        } else {
            tracing::debug!(user_id, "User enrollment state already consistent");
        }

        Ok(report)
    }

    async fn try_reconcile(
        &self,
        user_id: &str,
        catalog: &HashMap<String, CourseFacts>,
    ) -> Result<ReconcileReport, AppError> {
        let now = Utc::now();
        let plan = |docs: &UserDocs| -> Result<Option<ReconcilePlan>, AppError> {
            let (plan, report) = plan_from_docs(user_id, docs, catalog, now);
            Ok(report.changed.then_some(plan))
        };

        let outcome = with_timeout(
            self.store_timeout,
            self.store.transact_reconciliation(user_id, &plan),
        )
        .await?;

        // Planning is pure, so replaying it over the documents the store
        // read gives the report for exactly what was committed.
        let (_, report) = plan_from_docs(user_id, &outcome.docs, catalog, now);
        Ok(report)
    }

    async fn load_course_facts(
        &self,
        course_ids: Vec<String>,
    ) -> Result<HashMap<String, CourseFacts>, AppError> {
        let t = self.store_timeout;
        let results: Vec<Result<Option<(String, CourseFacts)>, AppError>> =
            stream::iter(course_ids)
                .map(|course_id| async move {
                    let Some(course) = with_timeout(t, self.store.get_course(&course_id)).await?
                    else {
                        return Ok(None);
                    };
                    let counts =
                        with_timeout(t, self.store.count_course_contents(&course_id)).await?;
                    let facts = CourseFacts {
                        total_lessons: counts.effective_lessons(&course),
                        title: course.title,
                    };
                    Ok::<_, AppError>(Some((course_id, facts)))
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut catalog = HashMap::new();
        for result in results {
            if let Some((course_id, facts)) = result? {
                catalog.insert(course_id, facts);
            }
        }
        Ok(catalog)
    }

    /// Reconcile every known user. Individual failures are collected, not
    /// fatal.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary, AppError> {
        let user_ids = with_timeout(self.store_timeout, self.store.list_user_ids()).await?;
        tracing::info!(users = user_ids.len(), "Starting full reconciliation");

        let results: Vec<(String, Result<ReconcileReport, AppError>)> = stream::iter(user_ids)
            .map(|user_id| async move {
                let result = self.reconcile_user(&user_id).await;
                (user_id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for (user_id, result) in results {
            summary.users_scanned += 1;
            match result {
                Ok(report) if report.changed => summary.users_repaired += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Reconciliation failed");
                    summary.failures.push(ReconcileFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        summary.failures.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        tracing::info!(
            users_scanned = summary.users_scanned,
            users_repaired = summary.users_repaired,
            failures = summary.failures.len(),
            "Full reconciliation finished"
        );
        Ok(summary)
    }

    /// Recount a course's modules and lessons and rewrite its cached totals.
    pub async fn recompute_course_stats(&self, course_id: &str) -> Result<CourseStatsReport, AppError> {
        let course_id = validate_id("courseId", course_id)?;
        let t = self.store_timeout;

        let mut course = with_timeout(t, self.store.get_course(course_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {course_id}")))?;
        let counts: CourseContentCounts =
            with_timeout(t, self.store.count_course_contents(course_id)).await?;

        let report = CourseStatsReport {
            course_id: course_id.to_string(),
            previous_modules: course.total_modules,
            previous_lessons: course.total_lessons,
            modules: counts.modules,
            lessons: counts.lessons,
            changed: course.total_modules != counts.modules
                || course.total_lessons != counts.lessons,
        };

        course.total_modules = counts.modules;
        course.total_lessons = counts.lessons;
        course.stats_updated_at = Some(Utc::now());
        with_timeout(t, self.store.upsert_course(&course)).await?;

        tracing::info!(
            course_id,
            modules = counts.modules,
            lessons = counts.lessons,
            changed = report.changed,
            "Course stats recomputed"
        );
        Ok(report)
    }
}

fn plan_from_docs(
    user_id: &str,
    docs: &UserDocs,
    catalog: &HashMap<String, CourseFacts>,
    now: DateTime<Utc>,
) -> (ReconcilePlan, ReconcileReport) {
    plan_reconciliation(
        user_id,
        docs.user.clone(),
        docs.enrollments.clone(),
        docs.progress.clone(),
        catalog,
        now,
    )
}

/// Compute the repair for one user without touching the store.
pub fn plan_reconciliation(
    user_id: &str,
    user: Option<User>,
    enrollments: Vec<Enrollment>,
    progress: Option<UserProgress>,
    catalog: &HashMap<String, CourseFacts>,
    now: DateTime<Utc>,
) -> (ReconcilePlan, ReconcileReport) {
    let mut report = ReconcileReport {
        user_id: user_id.to_string(),
        ..Default::default()
    };
    let mut to_write: Vec<Enrollment> = Vec::new();
    let mut retired: Vec<String> = Vec::new();

    let mut by_course: BTreeMap<String, Vec<Enrollment>> = BTreeMap::new();
    for enrollment in enrollments {
        by_course
            .entry(enrollment.course_id.clone())
            .or_default()
            .push(enrollment);
    }

    // Final state of every enrollment after the plan, keyed by course.
    let mut settled: BTreeMap<String, Enrollment> = BTreeMap::new();

    for (course_id, records) in by_course {
        let key = match EnrollmentKey::new(user_id, &course_id) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(user_id, course_id = %course_id, error = %e, "Skipping unreconcilable enrollments");
                continue;
            }
        };
        let canonical_id = key.document_id();
        let Some(mut merged) = merge_enrollments(&key, &records) else {
            continue;
        };
        let total = catalog.get(&course_id).map_or(0, |c| c.total_lessons);
        if total > 0 {
            merged.recompute_progress(total);
        }

        for record in records.iter().filter(|e| e.id != canonical_id) {
            report.merged_duplicates += 1;
            retired.push(record.id.clone());
        }

        let stored = records.iter().find(|e| e.id == canonical_id);
        if stored != Some(&merged) {
            report.rewritten_enrollments += 1;
            to_write.push(merged.clone());
        }
        settled.insert(course_id, merged);
    }

    if let Some(user) = &user {
        for course_id in &user.enrolled_courses {
            if settled.contains_key(course_id) || !catalog.contains_key(course_id) {
                continue;
            }
            let Ok(key) = EnrollmentKey::new(user_id, course_id) else {
                continue;
            };
            let enrolled_at = user.created_at.unwrap_or(now);
            let backfill = Enrollment::new_active(&key, None, enrolled_at);
            report.backfilled += 1;
            to_write.push(backfill.clone());
            settled.insert(course_id.clone(), backfill);
        }
    }

    let granting: Vec<&Enrollment> = settled
        .values()
        .filter(|e| e.status.grants_access())
        .collect();

    let user = match user {
        Some(original) => {
            let mut repaired = original.clone();
            let mut courses: Vec<String> = Vec::new();
            for course_id in &original.enrolled_courses {
                let keep = match settled.get(course_id) {
                    Some(enrollment) => enrollment.status.grants_access(),
                    None => true,
                };
                if keep && !courses.contains(course_id) {
                    courses.push(course_id.clone());
                }
            }
            for enrollment in &granting {
                if !courses.contains(&enrollment.course_id) {
                    courses.push(enrollment.course_id.clone());
                }
            }
            repaired.enrolled_courses = courses;
            repaired.course_access = original.course_access || !granting.is_empty();
            if repaired != original {
                repaired.updated_at = Some(now);
                report.user_repaired = true;
            }
            Some(repaired)
        }
        None if !granting.is_empty() => {
            let mut stub = User::stub(user_id, now);
            for enrollment in &granting {
                stub.add_enrolled_course(&enrollment.course_id);
            }
            stub.course_access = true;
            report.user_repaired = true;
            Some(stub)
        }
        None => None,
    };

    let original_progress = progress.clone();
    let mut rebuilt = progress.unwrap_or_else(|| UserProgress::new(user_id));
    rebuilt.user_id = user_id.to_string();
    rebuilt.dedupe_snapshots();
    let previous = std::mem::take(&mut rebuilt.enrolled_courses);
    for enrollment in &granting {
        let facts = catalog.get(&enrollment.course_id);
        let title = facts.map(|c| c.title.as_str()).unwrap_or_default();
        let mut snapshot = previous
            .iter()
            .find(|s| s.course_id == enrollment.course_id)
            .cloned()
            .unwrap_or_else(|| CourseProgressSnapshot::zeroed(&enrollment.course_id, title));
        if snapshot.title.is_empty() {
            snapshot.title = title.to_string();
        }
        let total = facts.map_or(snapshot.total_lessons, |c| c.total_lessons);
        snapshot.sync_from(enrollment, total);
        rebuilt.enrolled_courses.push(snapshot);
    }
    rebuilt.recount(granting.iter().copied());

    let progress_changed = match &original_progress {
        Some(original) => *original != rebuilt,
        None => !granting.is_empty(),
    };
    if progress_changed {
        rebuilt.updated_at = Some(now);
        report.progress_repaired = true;
    }

    report.deleted_ids = retired.clone();
    report.changed = !to_write.is_empty()
        || !retired.is_empty()
        || report.user_repaired
        || report.progress_repaired;

    let plan = ReconcilePlan {
        user_id: user_id.to_string(),
        user,
        enrollments: to_write,
        retired_enrollment_ids: retired,
        progress: rebuilt,
    };
    (plan, report)
}
