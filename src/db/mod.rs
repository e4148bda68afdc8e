//! Database layer.
//!
//! [`CourseStore`] is the seam between the enrollment rules and whatever
//! holds the documents. Production uses Firestore; tests and local runs can
//! use the in-memory store.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::InMemoryStore;

use crate::error::AppError;
use crate::models::enrollment::merge_enrollments;
use crate::models::{
    Course, CourseContentCounts, Enrollment, EnrollmentKey, Payment, User, UserProgress,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const COURSES: &str = "courses";
    pub const MODULES: &str = "modules";
    pub const LESSONS: &str = "lessons";
    /// Keyed by `{userId}_{courseId}`
    pub const ENROLLMENTS: &str = "enrollments";
    /// Keyed by user ID
    pub const USER_PROGRESS: &str = "userProgress";
    /// Keyed by processor session ID
    pub const PAYMENTS: &str = "payments";
}

/// What a transaction closure wants done with its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnDecision {
    Commit,
    Skip,
}

/// Snapshot of one learner's documents for one course, read inside a
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct LearnerDocs {
    pub user: Option<User>,
    /// Enrollment at the canonical ID
    pub enrollment: Option<Enrollment>,
    /// Every enrollment with this `userId`, as read (canonical included)
    pub user_enrollments: Vec<Enrollment>,
    pub progress: Option<UserProgress>,
    /// Non-canonical enrollment IDs to delete on commit
    pub retired_enrollment_ids: Vec<String>,
}

impl LearnerDocs {
    /// Fold enrollments for this course that live under a non-canonical ID
    /// into the canonical record, marking their IDs for deletion.
    ///
    /// Returns `true` if anything was adopted.
    pub fn adopt_legacy_enrollments(&mut self, key: &EnrollmentKey) -> bool {
        let canonical_id = key.document_id();
        let strays: Vec<Enrollment> = self
            .user_enrollments
            .iter()
            .filter(|e| e.course_id == key.course_id() && e.id != canonical_id)
            .filter(|e| !self.retired_enrollment_ids.contains(&e.id))
            .cloned()
            .collect();
        if strays.is_empty() {
            return false;
        }

        let mut records = strays.clone();
        if let Some(current) = self.enrollment.take() {
            records.push(current);
        }
        self.enrollment = merge_enrollments(key, &records);
        self.retired_enrollment_ids
            .extend(strays.into_iter().map(|e| e.id));
        true
    }

    /// The user's enrollments as they will look after commit: retired IDs
    /// dropped and the canonical record for this course replaced by the
    /// working copy.
    pub fn effective_enrollments(&self) -> Vec<&Enrollment> {
        let overlay_id = self.enrollment.as_ref().map(|e| e.id.as_str());
        let mut out: Vec<&Enrollment> = self
            .user_enrollments
            .iter()
            .filter(|e| Some(e.id.as_str()) != overlay_id)
            .filter(|e| !self.retired_enrollment_ids.contains(&e.id))
            .collect();
        if let Some(enrollment) = &self.enrollment {
            out.push(enrollment);
        }
        out
    }
}

/// Result of [`CourseStore::transact_learner`].
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    /// The snapshot after the closure ran
    pub docs: LearnerDocs,
    pub committed: bool,
}

/// Pure read-modify-write step run inside a learner transaction. It may run
/// more than once if the store retries.
pub type LearnerTxn<'a> =
    dyn Fn(&mut LearnerDocs) -> Result<TxnDecision, AppError> + Send + Sync + 'a;

/// One user's documents, read inside a reconciliation transaction.
#[derive(Debug, Clone, Default)]
pub struct UserDocs {
    pub user: Option<User>,
    /// Every enrollment with this `userId`, whatever its document ID
    pub enrollments: Vec<Enrollment>,
    pub progress: Option<UserProgress>,
}

/// Result of [`CourseStore::transact_reconciliation`].
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// The documents the committed (or skipped) plan was computed from
    pub docs: UserDocs,
    pub committed: bool,
}

/// Plans a rewrite from documents read inside the transaction. `None`
/// means there is nothing to write. May run more than once.
pub type ReconcileTxn<'a> =
    dyn Fn(&UserDocs) -> Result<Option<ReconcilePlan>, AppError> + Send + Sync + 'a;

/// Full rewrite of one user's enrollment state produced by reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub user_id: String,
    pub user: Option<User>,
    /// Canonical enrollments to write (each at its canonical ID)
    pub enrollments: Vec<Enrollment>,
    /// Non-canonical enrollment IDs to delete
    pub retired_enrollment_ids: Vec<String>,
    pub progress: UserProgress,
}

/// Document store operations needed by the enrollment core.
#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError>;

    async fn upsert_user(&self, user: &User) -> Result<(), AppError>;

    /// IDs of every user document.
    async fn list_user_ids(&self) -> Result<Vec<String>, AppError>;

    async fn get_course(&self, course_id: &str) -> Result<Option<Course>, AppError>;

    async fn upsert_course(&self, course: &Course) -> Result<(), AppError>;

    /// Count modules and lessons across both catalog layouts.
    async fn count_course_contents(&self, course_id: &str)
        -> Result<CourseContentCounts, AppError>;

    /// Enrollment at exactly this document ID.
    async fn get_enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>, AppError>;

    /// Enrollments matching (userId, courseId) regardless of document ID.
    async fn find_enrollments(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<Enrollment>, AppError>;

    async fn list_user_enrollments(&self, user_id: &str) -> Result<Vec<Enrollment>, AppError>;

    async fn get_user_progress(&self, user_id: &str) -> Result<Option<UserProgress>, AppError>;

    async fn get_payment(&self, session_id: &str) -> Result<Option<Payment>, AppError>;

    async fn upsert_payment(&self, payment: &Payment) -> Result<(), AppError>;

    /// Atomic read-modify-write over one learner's documents for one course.
    ///
    /// Reads the user, the canonical enrollment, every enrollment of the
    /// user and the progress rollup; runs `apply`; on
    /// [`TxnDecision::Commit`] writes every present document and deletes
    /// retired enrollment IDs, all or nothing.
    async fn transact_learner(
        &self,
        key: &EnrollmentKey,
        apply: &LearnerTxn<'_>,
    ) -> Result<TxnOutcome, AppError>;

    /// Atomic read-plan-write over all of one user's documents.
    ///
    /// Reads the user, every enrollment of the user and the progress
    /// rollup; runs `plan`; writes the plan it returns, all or nothing. A
    /// concurrent writer to any of the read documents aborts the commit.
    async fn transact_reconciliation(
        &self,
        user_id: &str,
        plan: &ReconcileTxn<'_>,
    ) -> Result<ReconcileOutcome, AppError>;
}

/// Bound a store round trip. An elapsed timer means the store is
/// unreachable as far as the caller is concerned.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::UpstreamUnavailable(format!(
            "document store did not answer within {} ms",
            limit.as_millis()
        ))),
    }
}
